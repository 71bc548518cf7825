#![no_main]
use blockstore_rs::{BlockStorage, MemoryMedium, OpenMode, StorageMedium};
use libfuzzer_sys::fuzz_target;
use std::io::Write;
use std::sync::Arc;

// Arbitrary table and content bytes must never panic or hang on open, and a
// store that opens must serve every chain it reports
fuzz_target!(|data: &[u8]| {
    let split = data.len() / 2;
    let (table, content) = data.split_at(split);

    let medium = MemoryMedium::new();
    for (path, bytes) in [("Cache_fuzz/fat", table), ("Cache_fuzz/content", content)] {
        let mut stream = match medium.open_stream(path, OpenMode::ReadWrite) {
            Ok(s) => s,
            Err(_) => return,
        };
        if stream.write_all(bytes).is_err() {
            return;
        }
    }

    let shared: Arc<dyn StorageMedium> = Arc::new(medium);
    let mut storage = match BlockStorage::open(shared, "fuzz", 32, 32 * 64) {
        Ok(s) => s,
        Err(_) => return,
    };

    for id in storage.get_ids() {
        let _ = storage.read(id);
    }
    let _ = storage.compact();
});
