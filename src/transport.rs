//! USB transport layer shared by a session's devices.
//!
//! Thin wrapper around a dedicated [`rusb::Context`] so library users can run
//! their own libusb sessions without interference. Hotplug notifications are
//! forwarded into a channel and consumed by the session's event thread, which
//! keeps every attach/detach callback serialized with transfer processing.

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::time::Duration;

/// Default timeout for USB control transfers (milliseconds).
pub(crate) const CTRL_TIMEOUT: Duration = Duration::from_millis(500);

/// Hotplug notification forwarded to the event thread.
pub(crate) enum HotplugEvent {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

pub(crate) struct UsbTransport {
    context: Context,
    hotplug_tx: Sender<HotplugEvent>,
    hotplug_rx: Receiver<HotplugEvent>,
}

impl UsbTransport {
    pub(crate) fn new() -> rusb::Result<Self> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = unbounded();
        Ok(Self {
            context,
            hotplug_tx,
            hotplug_rx,
        })
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    /// Register hotplug forwarding with libusb.
    ///
    /// Returns `None` where the platform has no hotplug support; scanning
    /// still works, only automatic attach/detach tracking is lost.
    pub(crate) fn register_hotplug(&self) -> Option<Registration<Context>> {
        if !rusb::has_hotplug() {
            tracing::warn!("libusb reports no hotplug support on this platform");
            return None;
        }
        let forwarder: Box<dyn Hotplug<Context>> = Box::new(HotplugForwarder {
            tx: self.hotplug_tx.clone(),
        });
        match HotplugBuilder::new()
            .enumerate(false)
            .register(self.context.clone(), forwarder)
        {
            Ok(registration) => Some(registration),
            Err(e) => {
                tracing::warn!("Failed to register hotplug callback: {}", e);
                None
            }
        }
    }

    /// One blocking event-dispatch step. Hotplug callbacks fire inside.
    pub(crate) fn handle_events(&self, timeout: Duration) -> rusb::Result<()> {
        self.context.handle_events(Some(timeout))
    }

    /// Queued hotplug notifications, drained by the event thread after each
    /// dispatch step.
    pub(crate) fn pending_hotplug(&self) -> impl Iterator<Item = HotplugEvent> + '_ {
        self.hotplug_rx.try_iter()
    }

    /// All devices on the bus whose (VID, PID) is in `allow_list`.
    pub(crate) fn matching_devices(
        &self,
        allow_list: &[(u16, u16)],
    ) -> rusb::Result<Vec<Device<Context>>> {
        let mut matches = Vec::new();
        let devices = self.context.devices()?;
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    tracing::debug!(
                        "Skipping bus {:03} device {:03}: no descriptor ({})",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            if allow_list.contains(&(desc.vendor_id(), desc.product_id())) {
                matches.push(device);
            }
        }
        Ok(matches)
    }
}

/// Forwards libusb hotplug callbacks into the transport channel; the actual
/// list mutation happens on the event thread right after dispatch.
struct HotplugForwarder {
    tx: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        tracing::debug!(
            "USB arrival on bus {:03} address {:03}",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        tracing::debug!(
            "USB departure from bus {:03} address {:03}",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(HotplugEvent::Left(device));
    }
}
