// Priority ordering scenarios driven through the public api across every backend.
use queuestore::api::{
    Handle, LinkedStore, Message, MessageStore, QueueStore, StoreConfig, StoreMode,
    open_queue_store,
};

struct XorShift64(u64);

impl XorShift64 {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn priority(&mut self) -> u8 {
        (self.next() % 10) as u8
    }
}

fn traversal<S: LinkedStore>(store: &MessageStore<S>) -> Vec<(Handle, Message)> {
    let mut out = Vec::new();
    let mut cursor = store.first().expect("first");
    while let Some(handle) = cursor {
        out.push((handle, store.retrieve(handle).expect("retrieve")));
        cursor = store.next(handle).expect("next");
    }
    out
}

fn assert_descending(entries: &[(Handle, Message)]) {
    for pair in entries.windows(2) {
        assert!(
            pair[0].1.priority >= pair[1].1.priority,
            "priority {} at {} before {} at {}",
            pair[0].1.priority,
            pair[0].0,
            pair[1].1.priority,
            pair[1].0
        );
    }
}

fn backends(config: &StoreConfig) -> Vec<(&'static str, QueueStore)> {
    let plain = StoreConfig {
        journal_enabled: false,
        ..config.clone()
    };
    vec![
        (
            "journaled",
            open_queue_store(config, "journaled", StoreMode::Persistent, None).expect("journaled"),
        ),
        (
            "block",
            open_queue_store(&plain, "block", StoreMode::Persistent, None).expect("block"),
        ),
        (
            "memory",
            open_queue_store(config, "memory", StoreMode::NonPersistent, None).expect("memory"),
        ),
    ]
}

fn small_blocks(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        block_size: 128,
        initial_blocks: 32,
        extend_blocks: 64,
        ..StoreConfig::new(dir)
    }
}

#[test]
fn random_priorities_traverse_descending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = small_blocks(dir.path());
    for (label, mut store) in backends(&config) {
        let mut rng = XorShift64(0x2545_f491_4f6c_dd1d);
        for i in 0..178 {
            let message = Message::new(rng.priority(), format!("{label}-{i}").into_bytes())
                .with_id(format!("ID:{i}"));
            store.store(&message).expect("store").expect("space");
        }
        store.commit_changes().expect("commit");

        let entries = traversal(&store);
        assert_eq!(entries.len(), 178, "{label}");
        assert_descending(&entries);

        // FIFO within one priority: ids increase.
        for pair in entries.windows(2) {
            if pair[0].1.priority == pair[1].1.priority {
                let id = |m: &Message| m.message_id[3..].parse::<u32>().expect("id");
                assert!(id(&pair[0].1) < id(&pair[1].1), "{label}");
            }
        }
        store.close().expect("close");
    }
}

#[test]
fn delete_first_half_then_restore_keeps_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = small_blocks(dir.path());
    for (label, mut store) in backends(&config) {
        let mut rng = XorShift64(0x0123_4567_89ab_cdef);
        for i in 0..178 {
            let message = Message::new(rng.priority(), vec![i as u8; 40]);
            store.store(&message).expect("store").expect("space");
        }
        let entries = traversal(&store);
        for (handle, _) in &entries[..89] {
            store.delete(*handle).expect("delete");
        }
        assert_eq!(store.size(), 89, "{label}");
        assert_descending(&traversal(&store));

        for i in 0..89 {
            let message = Message::new(rng.priority(), vec![i as u8; 200]);
            store.store(&message).expect("store").expect("space");
        }
        store.commit_changes().expect("commit");
        let entries = traversal(&store);
        assert_eq!(entries.len(), 178, "{label}");
        assert_descending(&entries);
        store.destroy().expect("destroy");
    }
}

#[test]
fn interleaved_store_delete_keeps_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = small_blocks(dir.path());
    for (label, mut store) in backends(&config) {
        let mut rng = XorShift64(0xdead_beef_cafe_f00d);
        let mut live: Vec<Handle> = Vec::new();
        for step in 0..1500 {
            if live.is_empty() || rng.next() % 5 < 3 {
                let message = Message::new(rng.priority(), vec![step as u8; (step % 300) as usize]);
                live.push(store.store(&message).expect("store").expect("space"));
            } else {
                let index = (rng.next() % live.len() as u64) as usize;
                store.delete(live.swap_remove(index)).expect("delete");
            }
        }
        let entries = traversal(&store);
        assert_eq!(entries.len(), live.len(), "{label}");
        assert_descending(&entries);
        store.destroy().expect("destroy");
    }
}

#[test]
fn store_then_delete_all_fifo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig {
        max_volatile_messages: 10_000,
        ..StoreConfig::new(dir.path())
    };
    for (label, mut store) in backends(&config) {
        let mut rng = XorShift64(42);
        for i in 0..10_000u32 {
            let message = Message::new(rng.priority(), i.to_le_bytes().to_vec());
            store.store(&message).expect("store").expect("space");
            if i % 1000 == 999 {
                store.commit_changes().expect("commit");
            }
        }
        assert_eq!(store.size(), 10_000, "{label}");

        let mut deleted = 0;
        while let Some(handle) = store.first().expect("first") {
            store.delete(handle).expect("delete");
            deleted += 1;
        }
        store.commit_changes().expect("commit");
        assert_eq!(deleted, 10_000, "{label}");
        assert_eq!(store.size(), 0, "{label}");
        assert_eq!(store.first().expect("first"), None, "{label}");
        assert!(store.priority_index().buckets().iter().all(Option::is_none));
        store.destroy().expect("destroy");
    }
}

#[test]
fn stored_messages_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = small_blocks(dir.path());
    for (label, mut store) in backends(&config) {
        let message = Message::new(6, vec![0xc3; 1000])
            .with_id("ID:round-trip")
            .with_expiration_ms(1_800_000_000_000)
            .with_property("tenant", "acme")
            .with_property("retries", 2);
        let handle = store.store(&message).expect("store").expect("space");
        assert_eq!(store.retrieve(handle).expect("retrieve"), message, "{label}");
        assert_eq!(store.retrieve_priority(handle).expect("priority"), 6);
        store.destroy().expect("destroy");
    }
}

#[test]
fn usage_stays_in_bounds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig {
        block_size: 64,
        initial_blocks: 8,
        max_blocks: 64,
        extend_blocks: 8,
        max_volatile_messages: 64,
        ..StoreConfig::new(dir.path())
    };
    for (label, mut store) in backends(&config) {
        let mut handles = Vec::new();
        loop {
            assert!(store.store_usage() <= 100, "{label}");
            assert!(store.absolute_store_usage() <= store.store_usage(), "{label}");
            match store.store(&Message::new(3, vec![1u8; 20])).expect("store") {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        assert_eq!(handles.len(), 64, "{label}");
        assert_eq!(store.store_usage(), 100, "{label}");
        assert_eq!(store.absolute_store_usage(), 100, "{label}");
        for handle in handles.drain(..32) {
            store.delete(handle).expect("delete");
        }
        assert_eq!(store.store_usage(), 50, "{label}");
        assert_eq!(store.absolute_store_usage(), 50, "{label}");
        store.destroy().expect("destroy");
    }
}
