use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{domain::BotId, Result};

/// Device identity presented to the server at login.
///
/// The server ties "trusted device" state to these values, so they must stay stable
/// across restarts: derive them once and persist them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub display: String,
    pub product: String,
    pub device: String,
    pub brand: String,
    pub model: String,
    pub imei: String,
    pub android_id: String,
}

impl DeviceInfo {
    /// Derives a stable identity from the account number.
    pub fn for_bot(id: BotId) -> Self {
        let digest = Sha256::digest(format!("mbot-device:{}", id.0).as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        Self {
            display: format!("MBOT.{}.001", &hex[..6]),
            product: "mbot".to_string(),
            device: "mbot".to_string(),
            brand: "mbot".to_string(),
            model: "mbot".to_string(),
            imei: luhn_imei(&digest[..7]),
            android_id: hex[..16].to_string(),
        }
    }

    /// Reads `path`, or derives an identity for `id` and writes it there.
    pub fn load_or_create(path: &Path, id: BotId) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let info = Self::for_bot(id);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, serde_json::to_string_pretty(&info)?)?;
                tracing::info!(path = %path.display(), "generated new device identity");
                Ok(info)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// 14 digits from `seed` plus a Luhn check digit.
fn luhn_imei(seed: &[u8]) -> String {
    let mut digits: Vec<u32> = seed
        .iter()
        .flat_map(|b| [u32::from(b / 16 % 10), u32::from(b % 10)])
        .take(14)
        .collect();
    digits.resize(14, 0);

    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let dd = d * 2;
                if dd > 9 {
                    dd - 9
                } else {
                    dd
                }
            } else {
                d
            }
        })
        .sum();
    let check = (10 - sum % 10) % 10;

    digits
        .iter()
        .chain(std::iter::once(&check))
        .map(|d| char::from_digit(*d, 10).unwrap_or('0'))
        .collect()
}
