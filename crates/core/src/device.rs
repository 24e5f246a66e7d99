use serde::{Deserialize, Serialize};

/// A bookmarked remote device.
///
/// Owned by the bookmark store; a session only borrows it (through an
/// `Arc`) for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub product_id: String,
    pub name: String,
    /// Stream path entered by the user. Empty or `None` means "not set".
    #[serde(default)]
    pub rtsp_path: Option<String>,
}

impl Device {
    pub fn new(product_id: &str, device_id: &str, name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            product_id: product_id.to_string(),
            name: name.to_string(),
            rtsp_path: None,
        }
    }

    pub fn with_rtsp_path(mut self, path: &str) -> Self {
        self.rtsp_path = Some(path.to_string());
        self
    }
}
