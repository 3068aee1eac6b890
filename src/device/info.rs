use std::fmt;

/// Status reported by the device-info notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Left earbud battery, percent.
    pub battery_left: u8,
    /// Right earbud battery, percent.
    pub battery_right: u8,
    pub name: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (battery L={}% R={}%)",
            self.name, self.battery_left, self.battery_right
        )
    }
}
