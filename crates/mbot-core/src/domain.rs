use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Account number the bot logs in as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId(pub u64);

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client flavour announced to the server during login.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    AndroidPhone,
    AndroidPad,
    AndroidWatch,
    Ipad,
    Macos,
}

impl Protocol {
    /// Only some clients are allowed to log in by scanning a QR code.
    pub fn supports_qr_login(self) -> bool {
        matches!(self, Self::AndroidWatch | Self::Macos)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AndroidPhone => "android-phone",
            Self::AndroidPad => "android-pad",
            Self::AndroidWatch => "android-watch",
            Self::Ipad => "ipad",
            Self::Macos => "macos",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "android-phone" | "phone" => Ok(Self::AndroidPhone),
            "android-pad" | "pad" => Ok(Self::AndroidPad),
            "android-watch" | "watch" => Ok(Self::AndroidWatch),
            "ipad" => Ok(Self::Ipad),
            "macos" | "mac" => Ok(Self::Macos),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_protocol_aliases() {
        assert_eq!("ANDROID_WATCH".parse::<Protocol>().unwrap(), Protocol::AndroidWatch);
        assert_eq!("mac".parse::<Protocol>().unwrap(), Protocol::Macos);
        assert!("fax".parse::<Protocol>().is_err());
    }

    #[test]
    fn qr_login_is_limited_to_watch_and_macos() {
        assert!(Protocol::AndroidWatch.supports_qr_login());
        assert!(Protocol::Macos.supports_qr_login());
        assert!(!Protocol::AndroidPhone.supports_qr_login());
    }
}
