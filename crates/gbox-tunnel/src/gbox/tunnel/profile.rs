use serde::{Deserialize, Serialize};

/// What a tunnel process exposes. Both profiles run the same engine; they only differ in
/// defaults and in which API path mints the tunnel URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelProfile {
    /// Android debug bridge on the box.
    Adb,
    #[default]
    PortForward,
}

pub const ADB_PORT: u16 = 5555;

impl TunnelProfile {
    pub fn api_prefix(self) -> &'static str {
        match self {
            TunnelProfile::Adb => "/api/v1",
            TunnelProfile::PortForward => "",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelProfile::Adb => "adb",
            TunnelProfile::PortForward => "port-forward",
        }
    }
}

impl std::fmt::Display for TunnelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
