//! The session: device tracking, the background USB event thread, and the
//! capture state machine across every added device.
//!
//! A session owns a dedicated libusb context and one event thread. The
//! thread interleaves blocking USB event dispatch (which delivers hotplug
//! callbacks) with a bounded transfer pump over every running device, so
//! completion, error and hotplug notifications are all serialized on one
//! thread. Caller-facing methods are synchronous; `run()`, `cancel()`,
//! `end()` and `wait_for_completion()` block on the completion condition
//! variable, never on the event thread itself.

use crate::device::{Device, DeviceError, PumpStatus, DEFAULT_QUEUE_SIZE};
use crate::flasher::{self, FlashError};
use crate::transport::{HotplugEvent, UsbTransport};
use crate::{SAMBA_DEVICES, SUPPORTED_DEVICES};
use rusb::{Context, Registration};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Event-dispatch timeout while no capture is active.
const EVENT_TIMEOUT_IDLE: Duration = Duration::from_millis(100);
/// How long a flash target may take to re-enumerate in bootloader mode.
const BOOTLOADER_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation not permitted while a capture is active")]
    Busy,

    #[error("Device {serial} is not available in this session")]
    UnknownDevice { serial: String },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Firmware flash failed: {0}")]
    Flash(#[from] FlashError),
}

type CompletionCallback = Box<dyn FnMut(u64) + Send>;
type HotplugCallback = Box<dyn FnMut(Arc<Device>) + Send>;

#[derive(Default)]
struct Callbacks {
    completion: Option<CompletionCallback>,
    attach: Option<HotplugCallback>,
    detach: Option<HotplugCallback>,
}

struct SessionInner {
    transport: UsbTransport,
    /// All supported devices currently on the bus, session-bound or not.
    available: Mutex<Vec<Arc<Device>>>,
    /// Devices explicitly added; only these are started by `start()`.
    active: Mutex<Vec<Arc<Device>>>,
    /// Devices currently streaming; guarded by the completion lock.
    active_count: Mutex<usize>,
    completion_cv: Condvar,
    /// Non-zero once any cancellation has been requested this capture.
    cancellation: AtomicU64,
    queue_size: AtomicUsize,
    keep_running: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// Coordinator for one or more devices performing a synchronized capture.
pub struct Session {
    inner: Arc<SessionInner>,
    hotplug_reg: Mutex<Option<Registration<Context>>>,
    usb_thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session: a fresh USB context, hotplug registration and the
    /// background event thread, followed by an initial device scan.
    pub fn new() -> Result<Self, SessionError> {
        let transport = UsbTransport::new()?;
        let inner = Arc::new(SessionInner {
            transport,
            available: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            active_count: Mutex::new(0),
            completion_cv: Condvar::new(),
            cancellation: AtomicU64::new(0),
            queue_size: AtomicUsize::new(DEFAULT_QUEUE_SIZE),
            keep_running: AtomicBool::new(true),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let hotplug_reg = inner.transport.register_hotplug();
        let thread_inner = Arc::clone(&inner);
        let usb_thread = thread::Builder::new()
            .name("smu-usb".to_string())
            .spawn(move || thread_inner.event_loop())?;

        let session = Self {
            inner,
            hotplug_reg: Mutex::new(hotplug_reg),
            usb_thread: Some(usb_thread),
        };
        session.scan()?;
        Ok(session)
    }

    /// Re-enumerate the bus and rebuild the available-device list, reusing
    /// entries for units that are still present.
    pub fn scan(&self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let found = self.inner.transport.matching_devices(&SUPPORTED_DEVICES)?;
        let existing = self.inner.available.lock().unwrap().clone();

        let mut fresh = Vec::with_capacity(found.len());
        for usb_dev in &found {
            let key = (usb_dev.bus_number(), usb_dev.address());
            if let Some(device) = existing.iter().find(|d| d.bus_address() == key) {
                fresh.push(Arc::clone(device));
                continue;
            }
            match Device::probe(usb_dev) {
                Ok(Some(device)) => fresh.push(device),
                Ok(None) => {}
                Err(e) => log::warn!(
                    "Failed to probe device on bus {:03} address {:03}: {}",
                    key.0,
                    key.1,
                    e
                ),
            }
        }
        log::debug!("Scan found {} supported device(s)", fresh.len());
        *self.inner.available.lock().unwrap() = fresh;
        Ok(())
    }

    /// Snapshot of all supported devices currently recognized on the system.
    pub fn available_devices(&self) -> Vec<Arc<Device>> {
        self.inner.available.lock().unwrap().clone()
    }

    /// Snapshot of the devices added to this session.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.active.lock().unwrap().clone()
    }

    /// The available device matching `serial`, if any.
    pub fn get_device(&self, serial: &str) -> Option<Arc<Device>> {
        self.inner
            .available
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.serial() == serial)
            .cloned()
    }

    /// Add an available device to the session's active set.
    ///
    /// Adding the same device twice does not duplicate it.
    pub fn add(&self, device: &Arc<Device>) -> Result<Arc<Device>, SessionError> {
        self.ensure_idle()?;
        let known = self
            .inner
            .available
            .lock()
            .unwrap()
            .iter()
            .any(|d| Arc::ptr_eq(d, device));
        if !known {
            return Err(SessionError::UnknownDevice {
                serial: device.serial().to_string(),
            });
        }
        let mut active = self.inner.active.lock().unwrap();
        if !active.iter().any(|d| Arc::ptr_eq(d, device)) {
            device.added()?;
            active.push(Arc::clone(device));
            log::debug!("Added device {}", device.serial());
        }
        Ok(Arc::clone(device))
    }

    /// Scan, then try to add every available device.
    ///
    /// Returns the number of devices that could not be added (0 means full
    /// success).
    pub fn add_all(&self) -> Result<usize, SessionError> {
        self.scan()?;
        let mut failed = 0;
        for device in self.available_devices() {
            if let Err(e) = self.add(&device) {
                log::warn!("Failed to add device {}: {}", device.serial(), e);
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Remove a device from the active set. Removing a device that was
    /// never added is a no-op.
    pub fn remove(&self, device: &Arc<Device>) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let removed = {
            let mut active = self.inner.active.lock().unwrap();
            match active.iter().position(|d| Arc::ptr_eq(d, device)) {
                Some(idx) => {
                    active.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            // Best effort: the unit may already be gone from the bus.
            if let Err(e) = device.removed() {
                log::debug!("Failed to release {}: {}", device.serial(), e);
            }
            log::debug!("Removed device {}", device.serial());
        }
        Ok(())
    }

    /// Drop a device from the available list (and the active set, if it was
    /// added).
    pub fn destroy(&self, device: &Arc<Device>) -> Result<(), SessionError> {
        self.remove(device)?;
        let mut available = self.inner.available.lock().unwrap();
        available.retain(|d| !Arc::ptr_eq(d, device));
        Ok(())
    }

    /// Size of the per-device sample queues applied by the next
    /// [`Session::configure`], in samples.
    pub fn queue_size(&self) -> usize {
        self.inner.queue_size.load(Ordering::Acquire)
    }

    pub fn set_queue_size(&self, samples: usize) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.inner.queue_size.store(samples, Ordering::Release);
        Ok(())
    }

    /// Propagate a sample-rate configuration to every added device.
    pub fn configure(&self, sample_rate: u64) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let queue_size = self.queue_size();
        for device in self.devices() {
            device.configure(sample_rate, queue_size)?;
        }
        Ok(())
    }

    /// Begin an asynchronous capture of `samples` rows per device
    /// (0 = continuous, until cancelled).
    ///
    /// Non-blocking. After a successful start, only [`Session::cancel`] and
    /// [`Session::end`] are permitted until the session reports completion.
    pub fn start(&self, samples: u64) -> Result<(), SessionError> {
        let mut active_count = self.inner.active_count.lock().unwrap();
        if *active_count > 0 {
            return Err(SessionError::Busy);
        }
        self.inner.cancellation.store(0, Ordering::Release);
        let devices = self.inner.active.lock().unwrap().clone();
        if devices.is_empty() {
            return Ok(());
        }

        let started = (|| -> Result<(), SessionError> {
            for device in &devices {
                device.on()?;
            }
            if devices.len() > 1 {
                for device in &devices {
                    device.sync()?;
                }
            }
            for device in &devices {
                device.run(samples)?;
            }
            Ok(())
        })();

        if let Err(e) = started {
            // Do not leave outputs powered behind a failed start.
            for device in &devices {
                if let Err(off_err) = device.off() {
                    log::warn!(
                        "Failed to power down {} after aborted start: {}",
                        device.serial(),
                        off_err
                    );
                }
            }
            return Err(e);
        }

        *active_count = devices.len();
        log::debug!(
            "Capture started on {} device(s), {} samples each",
            devices.len(),
            samples
        );
        Ok(())
    }

    /// Run a capture and block until it completes: [`Session::start`]
    /// followed by [`Session::wait_for_completion`].
    pub fn run(&self, samples: u64) -> Result<(), SessionError> {
        self.start(samples)?;
        self.wait_for_completion();
        Ok(())
    }

    /// Request cancellation of the running capture and block until the
    /// event thread has torn everything down.
    pub fn cancel(&self) {
        self.inner.cancellation.fetch_add(1, Ordering::AcqRel);
        for device in self.devices() {
            device.cancel();
        }
        self.wait_for_completion();
    }

    /// Whether the session has been cancelled. Stays true until the next
    /// successful [`Session::start`].
    pub fn cancelled(&self) -> bool {
        self.inner.cancellation.load(Ordering::Acquire) != 0
    }

    /// Block until every streaming device has finished.
    pub fn wait_for_completion(&self) {
        let mut active = self.inner.active_count.lock().unwrap();
        while *active > 0 {
            active = self.inner.completion_cv.wait(active).unwrap();
        }
    }

    /// Wait for completion, then put every device's outputs into high
    /// impedance.
    pub fn end(&self) {
        self.wait_for_completion();
        for device in self.devices() {
            if let Err(e) = device.off() {
                log::warn!("Failed to power down {}: {}", device.serial(), e);
            }
        }
    }

    /// Callback run on the event thread at session completion. Receives the
    /// cancellation flag value: non-zero means a cancelled capture finished
    /// tearing down.
    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().completion = Some(Box::new(callback));
    }

    /// Callback run on the event thread when a supported device is plugged
    /// in.
    pub fn set_hotplug_attach_callback<F>(&self, callback: F)
    where
        F: FnMut(Arc<Device>) + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().attach = Some(Box::new(callback));
    }

    /// Callback run on the event thread when a device is unplugged.
    pub fn set_hotplug_detach_callback<F>(&self, callback: F)
    where
        F: FnMut(Arc<Device>) + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().detach = Some(Box::new(callback));
    }

    /// Deploy a firmware image.
    ///
    /// Target resolution order: the given device, else the first added
    /// device, else the first device already in bootloader mode. A
    /// normal-mode target is rebooted into the bootloader first and awaited
    /// on the bus. Every transport fault during the sequence surfaces as a
    /// [`FlashError`]: an aborted flash can leave the target unusable until
    /// power-cycled.
    pub fn flash_firmware(
        &self,
        file: &Path,
        device: Option<&Arc<Device>>,
    ) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let image = fs::read(file).map_err(FlashError::Io)?;

        let target = device
            .cloned()
            .or_else(|| self.inner.active.lock().unwrap().first().cloned());

        let bootloader = match target {
            Some(device) => {
                log::info!(
                    "Rebooting device {} into its bootloader",
                    device.serial()
                );
                device.samba_mode()?;
                // The unit re-enumerates under the bootloader identity; it
                // is gone from the session until re-flashed and rescanned.
                self.destroy(&device)?;
                self.wait_for_bootloader()?
            }
            None => self
                .inner
                .transport
                .matching_devices(&SAMBA_DEVICES)?
                .into_iter()
                .next()
                .ok_or(FlashError::NoTarget)?,
        };

        flasher::flash(&bootloader, &image)?;
        log::info!("Firmware deployed ({} bytes)", image.len());
        Ok(())
    }

    fn wait_for_bootloader(&self) -> Result<rusb::Device<Context>, FlashError> {
        let deadline = Instant::now() + BOOTLOADER_WAIT;
        loop {
            if let Some(device) = self
                .inner
                .transport
                .matching_devices(&SAMBA_DEVICES)?
                .into_iter()
                .next()
            {
                return Ok(device);
            }
            if Instant::now() >= deadline {
                return Err(FlashError::NoTarget);
            }
            thread::sleep(Duration::from_millis(200));
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if *self.inner.active_count.lock().unwrap() > 0 {
            return Err(SessionError::Busy);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Tear down any capture that is still running before stopping the
        // event thread it depends on.
        if *self.inner.active_count.lock().unwrap() > 0 {
            self.cancel();
        }
        self.inner.keep_running.store(false, Ordering::Release);
        if let Some(handle) = self.usb_thread.take() {
            if handle.join().is_err() {
                log::error!("USB event thread terminated abnormally");
            }
        }
        // Unregister hotplug before the context is dropped.
        self.hotplug_reg.lock().unwrap().take();
    }
}

impl SessionInner {
    /// Body of the background USB thread.
    fn event_loop(&self) {
        log::debug!("USB event thread started");
        while self.keep_running.load(Ordering::Acquire) {
            let idle = *self.active_count.lock().unwrap() == 0;
            let timeout = if idle {
                EVENT_TIMEOUT_IDLE
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.transport.handle_events(timeout) {
                self.handle_error(&e, "event dispatch");
            }
            self.process_hotplug();
            self.pump_devices();
        }
        log::debug!("USB event thread stopped");
    }

    fn process_hotplug(&self) {
        let events: Vec<HotplugEvent> = self.transport.pending_hotplug().collect();
        for event in events {
            match event {
                HotplugEvent::Arrived(usb_dev) => self.attached(&usb_dev),
                HotplugEvent::Left(usb_dev) => self.detached(&usb_dev),
            }
        }
    }

    /// Hotplug arrival, on the event thread.
    fn attached(&self, usb_dev: &rusb::Device<Context>) {
        let key = (usb_dev.bus_number(), usb_dev.address());
        {
            let available = self.available.lock().unwrap();
            if available.iter().any(|d| d.bus_address() == key) {
                return;
            }
        }
        match Device::probe(usb_dev) {
            Ok(Some(device)) => {
                log::info!("Device {} attached", device.serial());
                self.available.lock().unwrap().push(Arc::clone(&device));
                if let Some(cb) = self.callbacks.lock().unwrap().attach.as_mut() {
                    cb(device);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to probe attached device: {}", e),
        }
    }

    /// Hotplug departure, on the event thread. A device that disappears
    /// mid-capture is failed immediately so completion never hangs on it.
    fn detached(&self, usb_dev: &rusb::Device<Context>) {
        let key = (usb_dev.bus_number(), usb_dev.address());
        let device = {
            let mut available = self.available.lock().unwrap();
            match available.iter().position(|d| d.bus_address() == key) {
                Some(idx) => available.remove(idx),
                None => return,
            }
        };
        log::info!("Device {} detached", device.serial());

        let was_added = self
            .active
            .lock()
            .unwrap()
            .iter()
            .any(|d| Arc::ptr_eq(d, &device));
        if was_added && device.fail_capture() {
            log::warn!(
                "Device {} detached during an active capture",
                device.serial()
            );
            self.completion();
        }
        if let Some(cb) = self.callbacks.lock().unwrap().detach.as_mut() {
            cb(device);
        }
    }

    /// One bounded transfer pass over every added device.
    fn pump_devices(&self) {
        let devices = {
            let active = self.active.lock().unwrap();
            if active.is_empty() {
                return;
            }
            active.clone()
        };
        let cancel_requested = self.cancellation.load(Ordering::Acquire) != 0;
        for device in devices {
            match device.pump(cancel_requested) {
                PumpStatus::Inactive | PumpStatus::Active => {}
                PumpStatus::Completed => {
                    log::debug!("Device {} completed its capture", device.serial());
                    self.completion();
                }
                PumpStatus::Cancelled => {
                    log::debug!("Device {} cancelled its capture", device.serial());
                    self.completion();
                }
                PumpStatus::Errored(e) => {
                    self.handle_error(&e, device.serial());
                    self.completion();
                }
            }
        }
    }

    /// One device finished streaming; at zero the completion callback fires
    /// and every waiter wakes.
    fn completion(&self) {
        let mut active = self.active_count.lock().unwrap();
        if *active == 0 {
            return;
        }
        *active -= 1;
        if *active == 0 {
            let cancellation = self.cancellation.load(Ordering::Acquire);
            if let Some(cb) = self.callbacks.lock().unwrap().completion.as_mut() {
                cb(cancellation);
            }
            self.completion_cv.notify_all();
        }
    }

    /// Report a transport-level failure tagged with its origin.
    fn handle_error(&self, error: &rusb::Error, tag: &str) {
        log::error!("USB failure in {}: {}", tag, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run against an empty bus; they exercise the session lifecycle
    // invariants that hold without hardware attached.

    #[test]
    fn test_new_session_is_idle_and_uncancelled() {
        let session = Session::new().unwrap();
        assert!(!session.cancelled());
        assert!(session.devices().is_empty());
    }

    #[test]
    fn test_zero_device_capture_completes_immediately() {
        let session = Session::new().unwrap();
        session.run(100).unwrap();
        session.end();
    }

    #[test]
    fn test_get_device_unknown_serial_is_none() {
        let session = Session::new().unwrap();
        assert!(session.get_device("no-such-serial").is_none());
    }

    #[test]
    fn test_add_all_with_no_failures() {
        let session = Session::new().unwrap();
        let failed = session.add_all().unwrap();
        assert_eq!(failed, 0);
    }

    #[test]
    fn test_configure_without_devices_is_ok() {
        let session = Session::new().unwrap();
        session.set_queue_size(2000).unwrap();
        assert_eq!(session.queue_size(), 2000);
        session.configure(10_000).unwrap();
    }

    #[test]
    fn test_callbacks_can_be_installed_without_blocking() {
        let session = Session::new().unwrap();
        session.set_completion_callback(|_| {});
        session.set_hotplug_attach_callback(|_| {});
        session.set_hotplug_detach_callback(|_| {});
        session.run(0).unwrap();
    }

    #[test]
    fn test_cancel_without_capture_latches_flag_until_start() {
        let session = Session::new().unwrap();
        session.cancel();
        assert!(session.cancelled());
        // The next successful start clears the flag again.
        session.start(0).unwrap();
        assert!(!session.cancelled());
    }
}
