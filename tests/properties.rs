//! Property tests for buffer pooling and response correlation.

mod common;

use std::thread;

use msgpack_rpc_client::buffer::{BufferPool, ChunkBuffer, PoolPolicy};
use msgpack_rpc_client::{Client, ClientConfig};
use proptest::prelude::*;
use rmpv::Value;

use common::{tcp_server_with, Options};

const CHUNK: usize = 16;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn filled(pool: &BufferPool, data: &[u8]) -> ChunkBuffer {
    let mut buffer = pool.borrow(data.len()).unwrap();
    buffer.write_at(0, data).unwrap();
    buffer
}

fn policies() -> impl Strategy<Value = PoolPolicy> {
    prop_oneof![Just(PoolPolicy::Recycling), Just(PoolPolicy::AdHoc)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_borrowed_buffer_holds_what_was_written(
        policy in policies(),
        len in 1usize..200,
        seed in any::<u8>(),
    ) {
        let pool = BufferPool::new(policy, CHUNK);
        let data = pattern(len, seed);
        let buffer = filled(&pool, &data);

        prop_assert_eq!(buffer.len(), len);
        prop_assert_eq!(buffer.to_vec(), data.clone());

        drop(buffer);
        let again = pool.borrow(len).unwrap();
        prop_assert_eq!(again.len(), len);
    }

    #[test]
    fn prop_grow_preserves_prefix(
        policy in policies(),
        len in 1usize..100,
        extra in 1usize..100,
        seed in any::<u8>(),
    ) {
        let pool = BufferPool::new(policy, CHUNK);
        let data = pattern(len, seed);
        let mut buffer = filled(&pool, &data);

        buffer.grow(extra).unwrap();
        prop_assert_eq!(buffer.len(), len + extra);

        let mut prefix = vec![0u8; len];
        buffer.read_at(0, &mut prefix).unwrap();
        prop_assert_eq!(prefix, data);

        let tail = pattern(extra, seed.wrapping_add(1));
        buffer.write_at(len, &tail).unwrap();
        prop_assert_eq!(buffer.sub_range(len, extra).unwrap().to_vec(), tail);
    }

    #[test]
    fn prop_sub_range_matches_slice(
        len in 1usize..150,
        cut in any::<(prop::sample::Index, prop::sample::Index)>(),
        seed in any::<u8>(),
    ) {
        let pool = BufferPool::new(PoolPolicy::Recycling, CHUNK);
        let data = pattern(len, seed);
        let buffer = filled(&pool, &data);

        let offset = cut.0.index(len + 1);
        let count = cut.1.index(len - offset + 1);
        let view = buffer.sub_range(offset, count).unwrap();
        prop_assert_eq!(view.len(), count);
        prop_assert_eq!(view.to_vec(), data[offset..offset + count].to_vec());

        prop_assert!(buffer.sub_range(offset, len - offset + 1).is_err());
    }

    #[test]
    fn prop_split_and_append_keep_order(
        len in 2usize..150,
        at in any::<prop::sample::Index>(),
        seed in any::<u8>(),
    ) {
        let pool = BufferPool::new(PoolPolicy::Recycling, CHUNK);
        let data = pattern(len, seed);
        let mut back = filled(&pool, &data);
        let at = at.index(len);

        let mut front = back.split_to(at).unwrap();
        prop_assert_eq!(front.to_vec(), data[..at].to_vec());
        prop_assert_eq!(back.to_vec(), data[at..].to_vec());

        front.append(back).unwrap();
        prop_assert_eq!(front.to_vec(), data);
    }
}

/// Concurrent leases never share memory: each thread writes its own tag
/// and must read back only that tag.
#[test]
fn test_concurrent_leases_do_not_alias() {
    const THREADS: u8 = 8;
    const ROUNDS: usize = 200;

    let pool = BufferPool::new(PoolPolicy::Recycling, CHUNK);
    thread::scope(|scope| {
        for tag in 0..THREADS {
            let pool = pool.clone();
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let len = 1 + (round * 7 + tag as usize) % (CHUNK * 4);
                    let mut buffer = pool.borrow(len).unwrap();
                    buffer.write_at(0, &vec![tag; len]).unwrap();
                    thread::yield_now();
                    assert!(
                        buffer.to_vec().iter().all(|&b| b == tag),
                        "lease of thread {} was overwritten",
                        tag
                    );
                }
            });
        }
    });

    assert_eq!(pool.stats().leased_bytes, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// However the server orders its replies, every call gets its own.
    #[test]
    fn prop_shuffled_responses_reach_their_calls(
        order in (2usize..12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let calls = order.len();

        let outcome: Vec<(u64, Value)> = runtime.block_on(async move {
            let server = tcp_server_with(Options { reply_order: Some(order) }).await;
            let client = Client::connect(server.addr, ClientConfig::new()).await.unwrap();

            let handles: Vec<_> = (0..calls as u64)
                .map(|i| (i, client.begin_call("Echo", &(i,)).unwrap()))
                .collect();

            let mut outcome = Vec::with_capacity(calls);
            for (i, handle) in handles {
                outcome.push((i, handle.await.unwrap()));
            }
            assert_eq!(client.outstanding(), 0);
            client.close().await.unwrap();
            outcome
        });

        for (sent, received) in outcome {
            prop_assert_eq!(received, Value::from(sent));
        }
    }
}
