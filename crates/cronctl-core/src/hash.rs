//! One-way hashes used to key events and to hide action names from the
//! network-facing list endpoint.

use md5::{Digest, Md5};
use serde_json::Value;

/// Lowercase hex md5 of `input`.
pub fn md5_hex(input: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(input.as_ref()))
}

/// Canonical serialization of an argument payload.
///
/// The instance hash and the stored `args` column both use this form, so a
/// payload always hashes to the same instance regardless of which backend
/// persisted it.
pub fn serialize_args(args: &[Value]) -> String {
    Value::Array(args.to_vec()).to_string()
}

/// Instance identifier: md5 over the serialized argument payload.
pub fn instance_for(args: &[Value]) -> String {
    md5_hex(serialize_args(args))
}

/// Hashed action name as exposed by the list endpoint.
pub fn hash_action(action: &str) -> String {
    md5_hex(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn instance_depends_on_argument_order() {
        let a = instance_for(&[json!(1), json!("two")]);
        let b = instance_for(&[json!("two"), json!(1)]);
        assert_ne!(a, b);
        assert_eq!(a, instance_for(&[json!(1), json!("two")]));
    }

    #[test]
    fn empty_args_hash_to_empty_array() {
        assert_eq!(instance_for(&[]), md5_hex("[]"));
    }
}
