//! Name interning with open-addressed probing (§4.1).
//!
//! The compiler and the VM must resolve a name to the exact same hash, so
//! both sides share this table: the compiler interns names as it emits
//! `LoadHash`/`MakeObject` instructions, and the VM either interns fresh
//! names typed at the REPL or installs already-resolved `(hash, name)`
//! pairs straight from a bytecode blob (see `bytecode::decode_blob`), never
//! re-probing work the compiler already did.

use std::collections::HashMap;

/// Reserved sentinel hash for the `proto` member, fixed independent of its
/// raw hash so every object's prototype slot lives at the same key.
pub const PROTO_HASH: u32 = 0;

/// FNV-1a over the name's UTF-8 bytes. Any well-distributed 32-bit hash
/// works here; the probe sequence is what makes collisions safe.
pub fn raw_hash(name: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in name.as_bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Derives an odd step from a hash so the probe sequence `hash, hash+step,
/// hash+2*step, ...` visits every slot of the 32-bit space before repeating
/// (gcd(step, 2^32) == 1 for any odd step).
pub fn hash_step(h: u32) -> u32 {
    h.rotate_left(8) | 1
}

/// Name -> hash interning table, open-addressed by `(raw_hash, hash_step)`.
pub struct SymbolTable {
    names: Vec<String>,
    hashes: Vec<u32>,
    index_of_hash: HashMap<u32, usize>,
    pub has_next_hash: u32,
    pub get_next_hash: u32,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            names: Vec::new(),
            hashes: Vec::new(),
            index_of_hash: HashMap::new(),
            has_next_hash: 0,
            get_next_hash: 0,
        };
        // slot 0 is always `proto`, mirroring the compiler's constructor seed.
        table.insert_resolved(PROTO_HASH, "proto");
        table.has_next_hash = table.intern("has_next");
        table.get_next_hash = table.intern("get_next");
        table
    }

    /// Resolves `name` to its hash without requiring it be new, probing the
    /// same way `intern` would but never inserting.
    fn probe(&self, name: &str) -> u32 {
        if name == "proto" {
            return PROTO_HASH;
        }
        let mut hash = raw_hash(name);
        let step = hash_step(hash);
        loop {
            match self.index_of_hash.get(&hash) {
                None => return hash,
                Some(&idx) if self.names[idx] == name => return hash,
                Some(_) => hash = hash.wrapping_add(step),
            }
        }
    }

    /// Resolves `name`, inserting a new symbol table entry if this is the
    /// first time it's been seen. Returns the resolved hash.
    pub fn intern(&mut self, name: &str) -> u32 {
        let hash = self.probe(name);
        if !self.index_of_hash.contains_key(&hash) {
            self.push(hash, name);
        }
        hash
    }

    /// Installs an already-resolved `(hash, name)` pair verbatim, as when
    /// merging a bytecode blob's symbol records into the VM's table. A
    /// no-op if the hash is already present.
    pub fn insert_resolved(&mut self, hash: u32, name: &str) {
        if self.index_of_hash.contains_key(&hash) {
            return;
        }
        self.push(hash, name);
    }

    fn push(&mut self, hash: u32, name: &str) {
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.hashes.push(hash);
        self.index_of_hash.insert(hash, idx);
    }

    pub fn name_from_hash(&self, hash: u32) -> Option<&str> {
        self.index_of_hash
            .get(&hash)
            .map(|&idx| self.names[idx].as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates `(hash, name)` pairs from `offset` onward, in insertion
    /// order — used both for blob emission and for debug dumps (`-ds`).
    pub fn iter_from(&self, offset: usize) -> impl Iterator<Item = (u32, &str)> {
        self.hashes[offset..]
            .iter()
            .copied()
            .zip(self.names[offset..].iter().map(String::as_str))
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_is_always_hash_zero() {
        let t = SymbolTable::new();
        assert_eq!(t.name_from_hash(PROTO_HASH), Some("proto"));
    }

    #[test]
    fn intern_is_idempotent() {
        let mut t = SymbolTable::new();
        let a = t.intern("greet");
        let b = t.intern("greet");
        assert_eq!(a, b);
        assert_eq!(t.name_from_hash(a), Some("greet"));
    }

    #[test]
    fn reserved_iterator_hashes_are_cached_at_construction() {
        let t = SymbolTable::new();
        assert_eq!(t.name_from_hash(t.has_next_hash), Some("has_next"));
        assert_eq!(t.name_from_hash(t.get_next_hash), Some("get_next"));
    }

    #[test]
    fn collisions_resolve_by_probing_forward() {
        // R2: nameFromHash(hash(name)) == name must hold for every name
        // interned, even if raw hashes happen to collide.
        let mut t = SymbolTable::new();
        let names = ["a", "b", "ab", "ba", "foo", "bar", "proto_like"];
        let hashes: Vec<u32> = names.iter().map(|n| t.intern(n)).collect();
        for (n, h) in names.iter().zip(hashes.iter()) {
            assert_eq!(t.name_from_hash(*h), Some(*n));
        }
    }
}
