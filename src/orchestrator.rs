//! §4.G Runtime orchestrator: composes the event loop, CAN driver, storage
//! engine, gateway, and the (out-of-scope) protocol stack into the
//! reset-loop lifecycle of §4.G / §5.

use crate::can::driver::CanModule;
use crate::config::{GatewaySelection, RuntimeConfig};
use crate::emergency::{EdgeDebouncedFault, EmergencyCode, EmergencyRegistry};
use crate::eventloop::{EventLoop, WakeSource};
use crate::gateway::{Gateway, GatewayMode};
use crate::logging::log_printf;
use crate::od::ObjectDictionary;
use crate::protocol::{ProtocolStack, ResetCommand};
use crate::storage::StorageEngine;
use log::Level;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const MAINLINE_INTERVAL_US: u64 = 1_000; // 1ms mainline tick
const RT_INTERVAL_US: u64 = 1_000;
const CANSEND_DELAY_US: u64 = 100;
const RX_SLOTS: usize = 64;
const TX_SLOTS: usize = 16;
const AUTO_SAVE_INTERVAL_US: u64 = 60_000_000;

/// §7 `log_printf`, echoed to `gateway` when one is attached at the call
/// site; `None` everywhere a `Gateway` doesn't exist yet or outlives its
/// owning thread (the RT thread's own event loop).
fn log_gw(level: Level, gateway: Option<&mut Gateway>, args: std::fmt::Arguments) {
    match gateway {
        Some(gw) => log_printf(level, Some(&mut |bytes: &[u8]| gw.write_response(bytes)), args),
        None => log_printf(level, None, args),
    }
}

/// §4.G orchestrator: owns the components that persist across a
/// configuration reset (storage, the OD, the emergency FIFO) and rebuilds
/// the rest (event loop, CAN module, gateway) on each loop of the
/// reset-loop.
pub struct Orchestrator {
    config: RuntimeConfig,
    od: ObjectDictionary,
    emcy: EmergencyRegistry,
    storage: StorageEngine,
    stop_flag: Arc<AtomicBool>,
    auto_save_fault: EdgeDebouncedFault,
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig, storage: StorageEngine) -> Orchestrator {
        Orchestrator {
            config,
            od: ObjectDictionary::new(),
            emcy: EmergencyRegistry::new(),
            storage,
            stop_flag: Arc::new(AtomicBool::new(false)),
            auto_save_fault: EdgeDebouncedFault::new(),
        }
    }

    /// Registers SIGINT/SIGTERM → `stop_flag`, per §5 "Cancellation and
    /// shutdown" (the redesign of the raw `sig_atomic_t` pattern, §9).
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, self.stop_flag.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, self.stop_flag.clone())?;
        Ok(())
    }

    /// Runs the reset-loop until a `COMMUNICATION`/`APPLICATION`/`QUIT`
    /// command terminates it or a signal arrives, then shuts down. Returns
    /// the process exit code (§6: 0 clean, 1 fatal).
    pub fn run(&mut self, protocol: Box<dyn ProtocolStack>) -> i32 {
        let protocol = Arc::new(Mutex::new(protocol));
        let can = Arc::new(Mutex::new(CanModule::new(RX_SLOTS, TX_SLOTS)));
        let storage_err_mask = self.storage.init();
        if storage_err_mask != 0 {
            log_gw(
                Level::Warn,
                None,
                format_args!("storage init reported corrupt entries: mask {:#x}", storage_err_mask),
            );
            self.emcy.push(EmergencyCode::NonVolatileMemory, storage_err_mask);
        }

        let mut first_reset = true;
        let mut rt_handle: Option<thread::JoinHandle<()>> = None;
        let mut rt_stop: Option<Arc<AtomicBool>> = None;

        let exit_code = 'reset_loop: loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break 'reset_loop 0;
            }

            let mut evl = match EventLoop::create(MAINLINE_INTERVAL_US) {
                Ok(e) => e,
                Err(e) => {
                    log_gw(Level::Error, None, format_args!("fatal: failed to create event loop: {}", e));
                    break 'reset_loop 1;
                }
            };

            if let Err(e) = can.lock().add_interface(&mut evl, &self.config.can_device) {
                log_gw(
                    Level::Error,
                    None,
                    format_args!("fatal: failed to open CAN interface {}: {}", self.config.can_device, e),
                );
                break 'reset_loop 1;
            }

            if let Err(e) = protocol.lock().init(&self.od, &self.emcy) {
                log_gw(Level::Error, None, format_args!("fatal: protocol stack init failed: {}", e));
                break 'reset_loop 1;
            }
            protocol.lock().register_wakeup(evl.waker());

            if first_reset {
                if let Some(priority) = self.config.rt_priority {
                    let stop = Arc::new(AtomicBool::new(false));
                    rt_handle = Some(spawn_rt_thread(can.clone(), protocol.clone(), priority, stop.clone()));
                    rt_stop = Some(stop);
                }
                first_reset = false;
            }

            if let Err(e) = protocol.lock().init_pdos() {
                log_gw(Level::Error, None, format_args!("fatal: PDO init failed: {}", e));
                break 'reset_loop 1;
            }

            if let Err(e) = can.lock().set_normal_mode() {
                log_gw(Level::Error, None, format_args!("fatal: CAN module failed to enter normal mode: {}", e));
                break 'reset_loop 1;
            }

            let single_threaded = rt_handle.is_none();
            let mut gateway = self.open_gateway(&mut evl);

            let reset = self.inner_loop(&mut evl, &can, &protocol, gateway.as_mut(), single_threaded);

            can.lock().shutdown(&mut evl);

            match reset {
                ResetCommand::Communication => continue 'reset_loop,
                ResetCommand::Application => {
                    if let Some(stop) = rt_stop.take() {
                        stop.store(true, Ordering::Relaxed);
                        evl.trigger_wakeup();
                    }
                    if let Some(h) = rt_handle.take() {
                        let _ = h.join();
                    }
                    if self.config.reboot_on_reset_app {
                        self.sync_and_reboot();
                    }
                    break 'reset_loop 0;
                }
                ResetCommand::Quit | ResetCommand::None => {
                    if let Some(stop) = rt_stop.take() {
                        stop.store(true, Ordering::Relaxed);
                    }
                    if let Some(h) = rt_handle.take() {
                        let _ = h.join();
                    }
                    break 'reset_loop 0;
                }
            }
        };

        self.storage.shutdown();
        exit_code
    }

    fn open_gateway(&self, evl: &mut EventLoop) -> Option<Gateway> {
        let mode = match &self.config.gateway {
            GatewaySelection::Disabled => return None,
            GatewaySelection::Stdio => GatewayMode::Stdio,
            GatewaySelection::Local(path) => GatewayMode::UnixSocket(path.clone()),
            GatewaySelection::Tcp(port) => GatewayMode::Tcp(*port),
        };
        match Gateway::create(evl, mode, self.config.idle_timeout_us) {
            Ok(gw) => Some(gw),
            Err(e) => {
                log_gw(Level::Warn, None, format_args!("gateway failed to start: {}", e));
                None
            }
        }
    }

    /// §4.G step 6 inner loop, plus the auto-save tick and the
    /// `CANSEND_DELAY_US` fast-path from §4.G's closing paragraph.
    fn inner_loop(
        &mut self,
        evl: &mut EventLoop,
        can: &Arc<Mutex<CanModule>>,
        protocol: &Arc<Mutex<Box<dyn ProtocolStack>>>,
        mut gateway: Option<&mut Gateway>,
        single_threaded: bool,
    ) -> ResetCommand {
        let mut auto_save_elapsed_us = 0u64;

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                return ResetCommand::Quit;
            }

            let mut iteration = evl.wait();

            let ready_fd = match iteration.source {
                WakeSource::Fd(fd) => Some(fd),
                _ => None,
            };
            let events = evl.last_events();

            if single_threaded {
                if let Some(fd) = ready_fd {
                    can.lock().poll_event(fd, events);
                }
                let fired = iteration.fired_timer;
                if let Some(next) = protocol.lock().rt_step(false, fired) {
                    iteration.next_us = iteration.next_us.min(next);
                }
            }

            if let Some(gw) = gateway.as_deref_mut() {
                let mut fed = Vec::new();
                gw.poll_event(evl, ready_fd, events, iteration.dt_us, |bytes| fed.extend_from_slice(bytes));
                // Fed bytes would be handed to the ASCII parser here; that
                // parser lives in the out-of-scope protocol layer.
                let _ = fed;
            }

            let reset = protocol.lock().mainline_step();

            auto_save_elapsed_us += iteration.dt_us;
            if auto_save_elapsed_us >= AUTO_SAVE_INTERVAL_US {
                auto_save_elapsed_us = 0;
                let fail_mask = self.storage.auto_save_tick();
                if self.auto_save_fault.observe(fail_mask != 0) {
                    log_gw(
                        Level::Warn,
                        gateway.as_deref_mut(),
                        format_args!("auto-save tick reported failing entries: mask {:#x}", fail_mask),
                    );
                    self.emcy.push(EmergencyCode::NonVolatileAutoSave, fail_mask);
                }
            }

            can.lock().process_deferred_tx();
            let pending_tx = protocol.lock().pending_tx_count();
            if pending_tx > 0 {
                iteration.next_us = iteration.next_us.min(CANSEND_DELAY_US);
            }

            evl.finish_iteration(&iteration);

            if matches!(reset, ResetCommand::Communication | ResetCommand::Application | ResetCommand::Quit) {
                return reset;
            }
        }
    }

    fn sync_and_reboot(&self) {
        unsafe {
            libc::sync();
            libc::reboot(libc::RB_AUTOBOOT);
        }
    }
}

/// Spawns the RT thread (§5 "Two OS threads"). Runs `wait`/`finish_iteration`
/// around one step: CAN RX dispatch, then — iff the iteration fired from the
/// periodic timer — SYNC/RPDO/TPDO via `ProtocolStack::rt_step`.
fn spawn_rt_thread(
    can: Arc<Mutex<CanModule>>,
    protocol: Arc<Mutex<Box<dyn ProtocolStack>>>,
    priority: u32,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        apply_realtime_priority(priority);

        let mut evl = match EventLoop::create(RT_INTERVAL_US) {
            Ok(e) => e,
            Err(e) => {
                log_gw(Level::Error, None, format_args!("RT thread failed to create its event loop: {}", e));
                return;
            }
        };

        while !stop.load(Ordering::Relaxed) {
            let mut iteration = evl.wait();
            if let WakeSource::Fd(fd) = iteration.source {
                can.lock().poll_event(fd, evl.last_events());
            }
            if let Some(next) = protocol.lock().rt_step(true, iteration.fired_timer) {
                iteration.next_us = iteration.next_us.min(next);
            }
            evl.finish_iteration(&iteration);
        }
    })
}

fn apply_realtime_priority(priority: u32) {
    unsafe {
        let param = libc::sched_param { sched_priority: priority as libc::c_int };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            log_gw(
                Level::Warn,
                None,
                format_args!("failed to set SCHED_FIFO priority {}: {}", priority, std::io::Error::last_os_error()),
            );
        } else {
            log_gw(Level::Info, None, format_args!("RT thread running under SCHED_FIFO at priority {}", priority));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NullProtocolStack;
    use std::path::PathBuf;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            can_device: "vcan0".to_owned(),
            node_id: None,
            rt_priority: None,
            reboot_on_reset_app: false,
            storage_prefix: PathBuf::new(),
            gateway: GatewaySelection::Disabled,
            idle_timeout_us: 0,
        }
    }

    #[test]
    fn run_without_a_can_interface_returns_fatal_exit_code() {
        // vcan0 is not guaranteed present in a build sandbox (§8 test
        // tooling), so opening it is expected to fail here and the
        // orchestrator should report a clean fatal exit rather than panic.
        let mut orch = Orchestrator::new(test_config(), StorageEngine::new());
        let code = orch.run(Box::new(NullProtocolStack));
        assert_eq!(code, 1);
    }

    #[test]
    fn stop_flag_set_before_run_exits_immediately() {
        let mut orch = Orchestrator::new(test_config(), StorageEngine::new());
        orch.stop_flag.store(true, Ordering::Relaxed);
        let code = orch.run(Box::new(NullProtocolStack));
        assert_eq!(code, 0);
    }
}
