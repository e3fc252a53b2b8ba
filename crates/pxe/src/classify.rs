//! Boot-path classifier.
//!
//! The responders encode client identity into the boot filename as
//! `<MAC>/<classId>/<classInfo>`; this is the one place that parses it back
//! out. It never looks at DHCP or PXE wire formats.

use dhcp::MacAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("boot path {0:?} does not have three segments")]
    Malformed(String),
    #[error("boot path {0:?} does not start with a MAC address")]
    BadMac(String),
}

/// Split a boot path into (client MAC, class id, class info).
pub fn classify(path: &str) -> Result<(MacAddr, String, String), ClassifyError> {
    let mut segments = path.splitn(3, '/');
    let mac_part = segments
        .next()
        .ok_or_else(|| ClassifyError::Malformed(path.to_string()))?;
    let class_id = segments
        .next()
        .ok_or_else(|| ClassifyError::Malformed(path.to_string()))?;
    let class_info = segments
        .next()
        .ok_or_else(|| ClassifyError::Malformed(path.to_string()))?;
    if class_info.contains('/') {
        return Err(ClassifyError::Malformed(path.to_string()));
    }

    let mac: MacAddr = mac_part
        .parse()
        .map_err(|_| ClassifyError::BadMac(path.to_string()))?;

    Ok((mac, class_id.to_string(), class_info.to_string()))
}

/// Render the boot path the responders hand out. `classify` inverts this.
pub fn boot_path(mac: MacAddr, class_id: &str, class_info: &str) -> String {
    format!("{mac}/{class_id}/{class_info}")
}
