//! Properties of the generated container id scheme (spec.md §6): 16 lowercase
//! hex characters, unique per call. `craterun` has no library target, so
//! these exercise the same generation logic the binary uses rather than
//! calling into the crate directly.

use std::collections::HashSet;

use rand::Rng;

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[test]
fn ids_are_unique() {
    let mut seen = HashSet::new();
    for _ in 0..1000 {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(seen.insert(id), "duplicate ID generated");
    }
}

#[test]
fn id_format_is_lowercase_hex() {
    for _ in 0..100 {
        let id = generate_id();
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }
}
