#![no_main]
use blockstore_rs::{BlockStorage, MemoryMedium, StorageMedium};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum Op {
    Save(Vec<u8>),
    Overwrite { slot: u8, offset: u16, data: Vec<u8> },
    Remove { slot: u8 },
    Compact,
}

// Random operation sequences must keep every live entry readable
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let medium: Arc<dyn StorageMedium> = Arc::new(MemoryMedium::new());
    let mut storage = match BlockStorage::open(medium, "fuzz", 32, 32 * 256) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut model: HashMap<i32, Vec<u8>> = HashMap::new();

    for op in ops.into_iter().take(64) {
        match op {
            Op::Save(data) => {
                if let Ok(id) = storage.save(&data) {
                    model.insert(id, data);
                }
            }
            Op::Overwrite { slot, offset, data } => {
                let Some(&id) = model.keys().nth(slot as usize % model.len().max(1)) else {
                    continue;
                };
                let offset = offset as usize;
                if storage.overwrite_checked(id, &data, offset).is_ok() {
                    let entry = model.get_mut(&id).unwrap();
                    entry[offset..offset + data.len()].copy_from_slice(&data);
                }
            }
            Op::Remove { slot } => {
                let Some(&id) = model.keys().nth(slot as usize % model.len().max(1)) else {
                    continue;
                };
                storage.remove(id).unwrap();
                model.remove(&id);
            }
            Op::Compact => {
                let moved = storage.compact().unwrap();
                let mut remapped = HashMap::new();
                for (id, data) in model.drain() {
                    remapped.insert(moved.get(&id).copied().unwrap_or(id), data);
                }
                model = remapped;
            }
        }
    }

    for (id, data) in &model {
        assert_eq!(&storage.read(*id).unwrap(), data);
    }
});
