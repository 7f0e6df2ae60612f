pub mod context;
pub mod sync;

use std::io::Read;

use crate::models::HookInput;

/// Read the hook input object from stdin. The hook contract is one JSON
/// object; anything else (empty stdin, truncated JSON) degrades to an empty
/// input rather than an error, since hooks must never block the host.
pub fn read_input(reader: &mut impl Read) -> HookInput {
    let mut buf = String::new();
    if reader.read_to_string(&mut buf).is_err() {
        return HookInput::default();
    }
    serde_json::from_str(&buf).unwrap_or_default()
}
