//! iomgr End-to-End Smoke Test
//!
//! Drives the full stack on the live kernel:
//!   Part A — Lifecycle: start N threads, interface gating, state machine
//!   Part B — Messaging: closures in io context, custom messages, bad targets
//!   Part C — FD readiness: global eventfd, reschedule to the least busy thread
//!   Part D — AIO drive: async/sync block io, forced-sync fallback, metrics
//!
//! Run: ./target/release/iomgr-smoke

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use iomgr::{AioDriveInterface, EvCallback, IoManager, IoMsg, ManagerState};
use iomgr_core::constants::MAX_OUTSTANDING_IO;
use iomgr_core::{DriveInterface, IoInterface};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok {
            self.pass(name);
        } else {
            self.fail(name, reason);
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn wait_for(pred: impl Fn() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

// ════════════════════════════════════════════════════════════
// Part A: Lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(
    t: &mut TestRunner,
    mgr: &Arc<IoManager>,
    drive: &Arc<AioDriveInterface>,
) -> Option<Arc<AtomicU64>> {
    t.section("Part A: Lifecycle");

    t.check(
        "initial state is Start",
        mgr.state() == ManagerState::Start,
        &format!("{:?}", mgr.state()),
    );

    let custom_msgs = Arc::new(AtomicU64::new(0));
    let custom_clone = Arc::clone(&custom_msgs);
    let started = mgr.start(
        1,
        2,
        Some(Arc::new(move |msg| {
            if matches!(msg, IoMsg::Custom { .. }) {
                custom_clone.fetch_add(1, Ordering::Relaxed);
            }
        })),
    );
    match started {
        Ok(()) => t.pass("start(1 custom iface, 2 threads)"),
        Err(e) => {
            t.fail("start(1 custom iface, 2 threads)", &e.to_string());
            return None;
        }
    }

    t.check(
        "waiting for the custom interface",
        mgr.state() == ManagerState::WaitingForInterfaces,
        &format!("{:?}", mgr.state()),
    );

    // The drive interface is the expected custom one; registering it
    // releases the thread pool.
    let as_drive: Arc<dyn DriveInterface> = drive.clone();
    t.check(
        "add_drive_interface(default)",
        mgr.add_drive_interface(as_drive, true).is_ok(),
        "registration failed",
    );

    t.check("wait_to_be_ready", mgr.wait_to_be_ready().is_ok(), "not ready");
    t.check(
        "state is Running",
        mgr.state() == ManagerState::Running,
        &format!("{:?}", mgr.state()),
    );

    let mut ifaces = 0;
    mgr.foreach_interface(|_| ifaces += 1);
    t.check("two interfaces registered", ifaces == 2, &format!("{}", ifaces));

    t.check(
        "default drive interface recorded",
        mgr.default_drive_interface().is_some(),
        "missing",
    );

    Some(custom_msgs)
}

// ════════════════════════════════════════════════════════════
// Part B: Messaging
// ════════════════════════════════════════════════════════════

fn test_messaging(t: &mut TestRunner, mgr: &Arc<IoManager>, custom_msgs: &Arc<AtomicU64>) {
    t.section("Part B: Messaging");

    let flag = Arc::new(AtomicU64::new(0));
    let flag_clone = Arc::clone(&flag);
    let sent = mgr.run_in_io_thread(move || {
        flag_clone.store(1, Ordering::Relaxed);
    });
    t.check("run_in_io_thread accepted", sent.is_ok(), "send failed");
    t.check(
        "closure executed in io context",
        wait_for(|| flag.load(Ordering::Relaxed) == 1, Duration::from_secs(5)),
        "flag never set",
    );

    let delivered = mgr.send_msg(-1, IoMsg::Custom { tag: 42 });
    t.check(
        &format!("broadcast custom msg -> {} threads", delivered),
        delivered == 2,
        "expected both io threads",
    );
    t.check(
        "default handler saw both",
        wait_for(
            || custom_msgs.load(Ordering::Relaxed) == 2,
            Duration::from_secs(5),
        ),
        "handler count mismatch",
    );

    t.check(
        "send to missing thread delivers 0",
        mgr.send_msg(99, IoMsg::Custom { tag: 0 }) == 0,
        "unexpected delivery",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: FD readiness
// ════════════════════════════════════════════════════════════

fn test_fd_readiness(t: &mut TestRunner, mgr: &Arc<IoManager>) {
    t.section("Part C: FD readiness");

    let iface: Arc<dyn IoInterface> = match mgr.default_general_interface() {
        Some(i) => i,
        None => {
            t.fail("default general interface", "missing");
            return;
        }
    };

    let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    t.check("eventfd()", efd >= 0, "creation failed");

    let drains = Arc::new(AtomicU64::new(0));
    let resched = Arc::new(AtomicU64::new(0));
    let drains_cb = Arc::clone(&drains);
    let resched_cb = Arc::clone(&resched);
    let callback: EvCallback = Box::new(move |fd, _cookie, events| {
        if events == libc::EPOLLOUT as u32 {
            resched_cb.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize && val > 0 {
            drains_cb.fetch_add(1, Ordering::Relaxed);
        }
    });

    let info = match mgr.add_fd(&iface, efd, callback, libc::EPOLLIN as u32, 9, 0, false) {
        Ok(i) => {
            t.pass("global fd registered");
            i
        }
        Err(e) => {
            t.fail("global fd registered", &e.to_string());
            unsafe { libc::close(efd) };
            return;
        }
    };

    let val: u64 = 1;
    unsafe {
        libc::write(efd, &val as *const u64 as *const libc::c_void, 8);
    }
    t.check(
        "readiness callback drained one edge",
        wait_for(|| drains.load(Ordering::Relaxed) == 1, Duration::from_secs(5)),
        "no callback",
    );
    std::thread::sleep(Duration::from_millis(50));
    t.check(
        "exactly one effective callback per edge",
        drains.load(Ordering::Relaxed) == 1,
        &format!("{}", drains.load(Ordering::Relaxed)),
    );

    t.check(
        "fd_reschedule to least busy thread",
        mgr.fd_reschedule(efd, libc::EPOLLOUT as u32).is_ok()
            && wait_for(|| resched.load(Ordering::Relaxed) == 1, Duration::from_secs(5)),
        "rescheduled callback missing",
    );

    t.check(
        "remove_fd",
        mgr.remove_fd(&iface, &info, None).is_ok() && mgr.fd_to_info(efd).is_none(),
        "removal failed",
    );
    unsafe { libc::close(efd) };
}

// ════════════════════════════════════════════════════════════
// Part D: AIO drive
// ════════════════════════════════════════════════════════════

fn test_aio_drive(t: &mut TestRunner, mgr: &Arc<IoManager>, drive: &Arc<AioDriveInterface>) {
    t.section("Part D: AIO drive");

    let completions: Arc<Mutex<Vec<(i64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let comp_clone = Arc::clone(&completions);
    drive.attach_completion_cb(Arc::new(move |res, cookie| {
        comp_clone.lock().unwrap().push((res, cookie));
    }));

    let path = std::env::temp_dir().join(format!("iomgr_smoke_{}.dat", std::process::id()));
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            t.fail("open scratch file", &e.to_string());
            return;
        }
    };
    let fd = file.as_raw_fd();
    t.pass("scratch file ready");

    // D1: sync write/read
    let payload = vec![0xC3u8; 4096];
    let wrote = drive.sync_write(fd, &payload, 0);
    t.check(
        "sync_write 4 KiB",
        matches!(wrote, Ok(n) if n == 4096),
        &format!("{:?}", wrote),
    );
    let mut readback = vec![0u8; 4096];
    let read = drive.sync_read(fd, &mut readback, 0);
    t.check(
        "sync_read matches",
        matches!(read, Ok(4096)) && readback == payload,
        "content mismatch",
    );

    // D2: async write from an io thread
    let buf = Arc::new(vec![0x7Eu8; 4096]);
    let submit_drive = Arc::clone(drive);
    let submit_buf = Arc::clone(&buf);
    let submitted = mgr.run_in_io_thread(move || {
        let _ = submit_drive.async_write(fd, submit_buf.as_ptr(), 4096, 4096, 1001);
    });
    t.check("async_write submitted", submitted.is_ok(), "submit failed");
    t.check(
        "async completion with cookie 1001",
        wait_for(
            || completions.lock().unwrap().contains(&(4096, 1001)),
            Duration::from_secs(5),
        ),
        "completion missing",
    );

    // D3: overflow the slot pool from a single closure; the loop cannot
    // harvest completions until the closure returns, so the last write
    // is forced down the sync path.
    completions.lock().unwrap().clear();
    let submit_drive = Arc::clone(drive);
    let submit_buf = Arc::clone(&buf);
    let burst = mgr.run_in_io_thread(move || {
        for i in 0..=(MAX_OUTSTANDING_IO as u64) {
            let _ = submit_drive.async_write(fd, submit_buf.as_ptr(), 4096, i * 4096, i);
        }
    });
    t.check("burst submitted", burst.is_ok(), "submit failed");
    t.check(
        &format!("{} completions (incl. forced-sync)", MAX_OUTSTANDING_IO + 1),
        wait_for(
            || completions.lock().unwrap().len() == MAX_OUTSTANDING_IO + 1,
            Duration::from_secs(10),
        ),
        &format!("got {}", completions.lock().unwrap().len()),
    );

    // D4: the metrics agree with what just happened
    let m = drive.metrics();
    t.check(
        "forced-sync empty-slot counter is 1",
        m.force_sync_io_empty_iocb.load(Ordering::Relaxed) == 1,
        &format!("{}", m.force_sync_io_empty_iocb.load(Ordering::Relaxed)),
    );
    t.check(
        &format!("async write counter is {}", MAX_OUTSTANDING_IO + 1),
        m.async_write_count.load(Ordering::Relaxed) == (MAX_OUTSTANDING_IO + 1) as u64,
        &format!("{}", m.async_write_count.load(Ordering::Relaxed)),
    );
    println!();
    for line in m.dump_prometheus().lines() {
        println!("    {}", line);
    }

    drop(file);
    let _ = std::fs::remove_file(&path);
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== iomgr End-to-End Smoke Test ===");
    let kver = std::fs::read_to_string("/proc/version").unwrap_or_default();
    println!("    kernel: {}", kver.trim().split(' ').nth(2).unwrap_or("?"));

    let mut t = TestRunner::new();
    let mgr = IoManager::new();
    let drive = AioDriveInterface::new(None);

    let custom_msgs = test_lifecycle(&mut t, &mgr, &drive);
    if let (Some(custom_msgs), ManagerState::Running) = (custom_msgs, mgr.state()) {
        test_messaging(&mut t, &mgr, &custom_msgs);
        test_fd_readiness(&mut t, &mgr);
        test_aio_drive(&mut t, &mgr, &drive);

        mgr.stop();
        t.check(
            "stop() reaches Stopped",
            mgr.state() == ManagerState::Stopped,
            &format!("{:?}", mgr.state()),
        );
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
