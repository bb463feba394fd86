//! Device-loss observers

/// Lifecycle of the device owned by the swapchain manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device objects exist and accept work
    Live,
    /// Loss detected; observers are releasing their device objects
    Lost,
    /// Device and window resources are being recreated
    Recovering,
}

/// Receives device-loss notifications from the swapchain manager
///
/// `on_device_lost` runs before any device object is dropped, so observers
/// release everything they created on the old device there. After
/// `on_device_restored` they recreate those objects on the new device.
pub trait DeviceNotify {
    /// The device was removed or reset
    fn on_device_lost(&mut self);

    /// A new device and swapchain are ready
    fn on_device_restored(&mut self);
}
