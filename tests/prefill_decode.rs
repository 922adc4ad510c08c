//! Prefilling L tokens then decoding M must match a single prefill of L + M.

mod common;

use std::sync::Arc;

use cachet::{AttentionKind, AttentionStrategy, BufferPolicy, CacheConfig, StorageDType, UpdateMode};
use common::*;

const TOL: f32 = 1e-4;

fn config(
    attention: AttentionKind,
    policy: BufferPolicy,
    update: UpdateMode,
    storage: StorageDType,
) -> Arc<CacheConfig> {
    CacheConfig::new(1, 4, 8, 16)
        .with_num_kv_heads(2)
        .with_policy(policy)
        .with_attention(attention)
        .with_update(update)
        .with_storage(storage)
        .with_flash_block_size(3)
        .with_ragged_blocks(4, None)
        .build()
        .unwrap()
}

fn check_equivalence(config: &Arc<CacheConfig>, prompt: usize, total: usize, label: &str) {
    let (client, device) = setup_cpu();
    let seq = Sequence::for_config(config, total, 0.3);
    let (heads, d) = (config.num_heads, config.head_dim);

    let (steps, cache) = prefill_then_decode(&client, &device, config, &seq, prompt);
    assert_eq!(cache.cursor(0).unwrap(), total, "{label}: cursor");

    let strategy = AttentionStrategy::from_config(config).unwrap();
    let (full, _) = prefill(&client, &device, &strategy, config, &seq, 0..total);
    let want = token_of(&full, heads, total, d, total - 1);
    let got = steps.last().unwrap();
    assert_close(got, &want, TOL, label);

    if config.storage == StorageDType::F32 {
        let reference = seq.reference(total - 1, config.window(), config.capacity);
        assert_close(got, &reference, TOL, &format!("{label} vs reference"));
    }
}

#[test]
fn test_prefill_decode_equivalence_all_strategies() {
    for attention in [AttentionKind::Dense, AttentionKind::Flash, AttentionKind::Ragged] {
        for update in [UpdateMode::Eager, UpdateMode::Lazy] {
            let config = config(attention, BufferPolicy::LeftAligned, update, StorageDType::F32);
            check_equivalence(&config, 5, 9, &format!("{attention:?}/{update:?}"));
        }
    }
}

#[test]
fn test_every_decode_step_matches_reference() {
    let (client, device) = setup_cpu();
    let config = config(
        AttentionKind::Flash,
        BufferPolicy::LeftAligned,
        UpdateMode::Eager,
        StorageDType::F32,
    );
    let seq = Sequence::for_config(&config, 12, 1.1);
    let (steps, _) = prefill_then_decode(&client, &device, &config, &seq, 4);
    for (i, got) in steps.iter().enumerate() {
        let pos = 4 + i;
        assert_close(got, &seq.reference(pos, 16, 16), TOL, &format!("step at {pos}"));
    }
}

#[test]
fn test_ring_with_window_past_capacity() {
    // 12 tokens through an 8-slot ring with a 5-token window
    for attention in [AttentionKind::Dense, AttentionKind::Flash] {
        for update in [UpdateMode::Eager, UpdateMode::Lazy] {
            let config = CacheConfig::new(1, 2, 4, 8)
                .with_window(5)
                .with_policy(BufferPolicy::Ring)
                .with_attention(attention)
                .with_update(update)
                .with_flash_block_size(2)
                .build()
                .unwrap();
            check_equivalence(&config, 5, 12, &format!("ring {attention:?}/{update:?}"));
        }
    }
}

#[test]
fn test_quantized_storage_prefill_decode_agree() {
    for storage in [StorageDType::Int8, StorageDType::F16, StorageDType::BF16] {
        for attention in [AttentionKind::Dense, AttentionKind::Ragged] {
            let config = config(attention, BufferPolicy::LeftAligned, UpdateMode::Eager, storage);
            check_equivalence(&config, 6, 10, &format!("{storage:?}/{attention:?}"));
        }
    }
}

#[test]
fn test_int8_stays_near_float_reference() {
    let (client, device) = setup_cpu();
    let config = config(
        AttentionKind::Dense,
        BufferPolicy::LeftAligned,
        UpdateMode::Lazy,
        StorageDType::Int8,
    );
    let seq = Sequence::for_config(&config, 8, 0.9);
    let (steps, _) = prefill_then_decode(&client, &device, &config, &seq, 5);
    let reference = seq.reference(7, 16, 16);
    // values are within half a step of 0.5/127 each; outputs are convex combinations
    assert_close(steps.last().unwrap(), &reference, 2e-2, "int8 vs f32");
}

#[test]
fn test_chunked_prefill_matches_single_prefill() {
    let (client, device) = setup_cpu();
    let config = config(
        AttentionKind::Dense,
        BufferPolicy::LeftAligned,
        UpdateMode::Eager,
        StorageDType::F32,
    );
    let strategy = AttentionStrategy::from_config(&config).unwrap();
    let seq = Sequence::for_config(&config, 9, 0.2);
    let (heads, d) = (config.num_heads, config.head_dim);

    let (_, chunk) = prefill(&client, &device, &strategy, &config, &seq, 0..4);
    let (q, k, v) = seq.block(4..9, &device);
    let positions = vec![(4..9).collect::<Vec<_>>()];
    let input = cachet::AttentionInput::new(&q, &k, &v, &positions);
    let (second, chunk) = strategy.prefill(&client, &input, chunk).unwrap();
    assert_eq!(chunk.len(), 9);

    let (full, _) = prefill(&client, &device, &strategy, &config, &seq, 0..9);
    let second = second.to_vec::<f32>();
    for t in 0..5 {
        assert_close(
            &token_of(&second, heads, 5, d, t),
            &token_of(&full, heads, 9, d, 4 + t),
            1e-5,
            &format!("chunk token {t}"),
        );
    }
}
