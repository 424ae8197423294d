use std::{sync::mpsc, thread, time::Duration};

use log::{debug, error, info};

use crate::cancel::{CancelToken, spawn_deferred_notice};
use crate::error::DfuseError;
use crate::session::SessionContext;

/// Pause between device-match attempts in both search loops.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const DRIVER_NOTICE_DELAY: Duration = Duration::from_secs(10);
const DRIVER_NOTICE: &str = "Still waiting for the device to reappear. \
    Use the Zadig utility to set the driver of 'STM32 BOOTLOADER' to libusb-win32.";

/// A device running application firmware, classified once at match time.
pub enum AppDevice<R> {
    /// Firmware exposes a way into the bootloader.
    DfuCapable(R),
    /// Firmware predates DFU support; re-matching it forever is pointless.
    Legacy { serial: String },
}

/// The enter-DFU capability of a running device. The reboot it triggers
/// makes the request itself fail on the bus; implementations swallow that.
pub trait RuntimeDevice {
    fn serial(&self) -> &str;
    fn enter_dfu_mode(&self) -> Result<(), DfuseError>;
}

/// Match-device-by-identity primitive required from the USB layer.
pub trait DeviceScanner {
    /// Handle to a device already in DFU mode.
    type Target;
    type Runtime: RuntimeDevice;

    fn find_target(
        &self,
        serial: Option<&str>,
    ) -> Result<Option<Self::Target>, DfuseError>;

    fn find_runtime(
        &self,
        serial: Option<&str>,
    ) -> Result<Option<AppDevice<Self::Runtime>>, DfuseError>;
}

/// Run both search loops until a bootloader shows up or the run is
/// cancelled: the calling thread polls for a DFU-mode device while a scoped
/// background task reboots matching application devices into DFU mode.
///
/// The background task is joined before this returns; a legacy-firmware
/// match travels back over a single-value channel and aborts the run.
pub fn wait_for_bootloader<S>(
    scanner: &S,
    ctx: &SessionContext,
    poll_interval: Duration,
) -> Result<S::Target, DfuseError>
where
    S: DeviceScanner + Sync,
{
    let responder_cancel = CancelToken::new();
    let (legacy_tx, legacy_rx) = mpsc::sync_channel::<String>(1);

    let result = thread::scope(|scope| {
        let task_cancel = responder_cancel.clone();
        let responder = scope.spawn(move || {
            respond_to_runtime_devices(
                scanner,
                ctx,
                task_cancel,
                legacy_tx,
                poll_interval,
            )
        });

        let result = poll_for_target(scanner, ctx, poll_interval);
        responder_cancel.cancel();
        if responder.join().is_err() {
            debug!("runtime device responder panicked");
        }
        result
    });

    match result {
        Err(DfuseError::Aborted) => match legacy_rx.try_recv() {
            Ok(serial) => Err(DfuseError::IncompatibleFirmware { serial }),
            Err(_) => Err(DfuseError::Aborted),
        },
        other => other,
    }
}

fn poll_for_target<S: DeviceScanner>(
    scanner: &S,
    ctx: &SessionContext,
    poll_interval: Duration,
) -> Result<S::Target, DfuseError> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(DfuseError::Aborted);
        }
        // opening a device mid-re-enumeration fails transiently; only
        // success or cancellation ends this loop
        match scanner.find_target(ctx.serial.as_deref()) {
            Ok(Some(target)) => return Ok(target),
            Ok(None) => {}
            Err(err) => debug!("DFU device scan failed: {err}"),
        }
        if ctx.cancel.wait_timeout(poll_interval) {
            return Err(DfuseError::Aborted);
        }
    }
}

fn respond_to_runtime_devices<S: DeviceScanner>(
    scanner: &S,
    ctx: &SessionContext,
    local: CancelToken,
    legacy_tx: mpsc::SyncSender<String>,
    poll_interval: Duration,
) {
    let mut notices = Vec::new();
    while !local.is_cancelled() && !ctx.cancel.is_cancelled() {
        match scanner.find_runtime(ctx.serial.as_deref()) {
            Ok(Some(AppDevice::Legacy { serial })) => {
                error!(
                    "firmware on device {serial} does not support DFU; \
                     flash it once over a debug probe, then retry"
                );
                let _ = legacy_tx.try_send(serial);
                // keeping the loop alive would just re-match the same unit
                ctx.cancel.cancel();
                break;
            }
            Ok(Some(AppDevice::DfuCapable(device))) => {
                info!("putting device {} into DFU mode", device.serial());
                if let Err(err) = device.enter_dfu_mode() {
                    debug!("enter-DFU request failed: {err}");
                }
                if cfg!(windows) {
                    notices.push(spawn_deferred_notice(
                        DRIVER_NOTICE.into(),
                        DRIVER_NOTICE_DELAY,
                        local.clone(),
                    ));
                }
            }
            Ok(None) => {}
            Err(err) => debug!("application device scan failed: {err}"),
        }
        // the pause keeps us from re-matching a unit that is mid-reboot
        if local.wait_timeout(poll_interval) {
            break;
        }
    }
    for notice in notices {
        let _ = notice.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_millis(5);

    struct MockRuntime {
        serial: String,
        entered: &'static AtomicUsize,
    }

    impl RuntimeDevice for MockRuntime {
        fn serial(&self) -> &str {
            &self.serial
        }
        fn enter_dfu_mode(&self) -> Result<(), DfuseError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    enum RuntimeBehavior {
        Absent,
        Capable(&'static AtomicUsize),
        Legacy,
    }

    struct MockScanner {
        target_after: usize,
        target_errors: usize,
        target_calls: AtomicUsize,
        runtime_calls: AtomicUsize,
        runtime: RuntimeBehavior,
    }

    impl MockScanner {
        fn new(target_after: usize, runtime: RuntimeBehavior) -> Self {
            MockScanner {
                target_after,
                target_errors: 0,
                target_calls: AtomicUsize::new(0),
                runtime_calls: AtomicUsize::new(0),
                runtime,
            }
        }

        /// Fail the first `n` target scans, as an open() does while the
        /// device is mid-re-enumeration.
        fn with_target_errors(mut self, n: usize) -> Self {
            self.target_errors = n;
            self
        }
    }

    impl DeviceScanner for MockScanner {
        type Target = &'static str;
        type Runtime = MockRuntime;

        fn find_target(
            &self,
            _serial: Option<&str>,
        ) -> Result<Option<&'static str>, DfuseError> {
            let calls = self.target_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls <= self.target_errors {
                return Err(DfuseError::ShortStatus { len: 0 });
            }
            Ok((calls >= self.target_after).then_some("bootloader"))
        }

        fn find_runtime(
            &self,
            _serial: Option<&str>,
        ) -> Result<Option<AppDevice<MockRuntime>>, DfuseError> {
            self.runtime_calls.fetch_add(1, Ordering::SeqCst);
            Ok(match self.runtime {
                RuntimeBehavior::Absent => None,
                RuntimeBehavior::Capable(entered) => {
                    Some(AppDevice::DfuCapable(MockRuntime {
                        serial: "385F324D3037".into(),
                        entered,
                    }))
                }
                RuntimeBehavior::Legacy => Some(AppDevice::Legacy {
                    serial: "385F324D3037".into(),
                }),
            })
        }
    }

    #[test]
    fn responder_stops_once_target_found() {
        let scanner = MockScanner::new(3, RuntimeBehavior::Absent);
        let ctx = SessionContext::new(None);

        let target = wait_for_bootloader(&scanner, &ctx, TICK).unwrap();
        assert_eq!(target, "bootloader");

        // the responder is joined before wait_for_bootloader returns, so no
        // further match attempts may happen from here on
        let calls = scanner.runtime_calls.load(Ordering::SeqCst);
        thread::sleep(TICK * 3);
        assert_eq!(scanner.runtime_calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn capable_devices_are_rebooted_into_dfu() {
        static ENTERED: AtomicUsize = AtomicUsize::new(0);
        let scanner = MockScanner::new(4, RuntimeBehavior::Capable(&ENTERED));
        let ctx = SessionContext::new(None);

        wait_for_bootloader(&scanner, &ctx, TICK).unwrap();
        assert!(ENTERED.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn legacy_firmware_aborts_the_run() {
        let scanner = MockScanner::new(usize::MAX, RuntimeBehavior::Legacy);
        let ctx = SessionContext::new(None);

        let err = wait_for_bootloader(&scanner, &ctx, TICK).unwrap_err();
        match err {
            DfuseError::IncompatibleFirmware { serial } => {
                assert_eq!(serial, "385F324D3037")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn transient_scan_errors_are_retried() {
        let scanner = MockScanner::new(1, RuntimeBehavior::Absent)
            .with_target_errors(2);
        let ctx = SessionContext::new(None);

        let target = wait_for_bootloader(&scanner, &ctx, TICK).unwrap();
        assert_eq!(target, "bootloader");
        assert!(scanner.target_calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn cancelled_context_aborts_promptly() {
        let scanner = MockScanner::new(usize::MAX, RuntimeBehavior::Absent);
        let ctx = SessionContext::new(None);
        ctx.cancel.cancel();

        let err = wait_for_bootloader(&scanner, &ctx, TICK).unwrap_err();
        assert!(matches!(err, DfuseError::Aborted));
    }
}
