//! Conversions between PnP instance ids (`PCI\VEN_..\..`) and the
//! device-interface paths the hypervisor reports for partitionable GPUs
//! (`\\?\PCI#VEN_..#..#{interface-guid}`).

const DEVICE_PATH_PREFIX: &str = r"\\?\";

/// Interface path → `#`-separated upper-case id without the interface GUID.
pub fn normalize_device_id(id: &str) -> String {
    let upper = id.trim().to_uppercase();
    let without_prefix = upper.strip_prefix(DEVICE_PATH_PREFIX).unwrap_or(&upper);
    let without_guid = match without_prefix.find("#{") {
        Some(cut) => &without_prefix[..cut],
        None => without_prefix,
    };
    without_guid.replace('\\', "#")
}

/// Either form → `\`-separated upper-case PnP instance id.
///
/// Two ids refer to the same device iff their comparison forms are equal.
pub fn normalize_for_comparison(id: &str) -> String {
    let id = id.trim();
    if id.is_empty() {
        return String::new();
    }
    let upper = id.replace('#', "\\").to_uppercase();
    let mut normalized = upper.strip_prefix(DEVICE_PATH_PREFIX).unwrap_or(&upper);
    if let Some(brace) = normalized.find('{') {
        if let Some(sep) = normalized[..brace].rfind('\\') {
            normalized = &normalized[..sep];
        }
    }
    normalized.to_string()
}

/// PCI devices are the only ones the exclusivity logic ever touches.
pub fn is_pci_device(instance_id: &str) -> bool {
    instance_id.trim().to_uppercase().starts_with(r"PCI\")
}
