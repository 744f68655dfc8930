//! Grouped-query attention against a strict reference implementation.

use qwen3_infer::kernels::gqa::gqa_forward;
use qwen3_infer::EngineError;

const MAX_ABS: f32 = 1e-3;

fn pattern(len: usize, seed: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 * 1.31 + seed).sin() * 0.6))
        .collect()
}

/// Left-to-right reference: per-head scores, stable softmax, weighted sum.
#[allow(clippy::too_many_arguments)]
fn reference_attention(
    query: &[f32],
    keys: &[f32],
    values: &[f32],
    num_heads: usize,
    num_groups: usize,
    head_dim: usize,
    seq_len: usize,
    max_seq_len: usize,
    scale: f32,
) -> Vec<f32> {
    let heads_per_group = num_heads / num_groups;
    let mut output = vec![0.0f32; num_heads * head_dim];
    for head in 0..num_heads {
        let group = head / heads_per_group;
        let q = &query[head * head_dim..(head + 1) * head_dim];
        let tile = group * max_seq_len * head_dim;

        let mut scores = vec![0.0f32; seq_len];
        for (pos, score) in scores.iter_mut().enumerate() {
            let k = &keys[tile + pos * head_dim..tile + (pos + 1) * head_dim];
            *score = q.iter().zip(k.iter()).map(|(&a, &b)| a * b).sum::<f32>() * scale;
        }
        let max = scores.iter().fold(f32::NEG_INFINITY, |m, &s| m.max(s));
        let mut sum = 0.0f32;
        for s in scores.iter_mut() {
            *s = (*s - max).exp();
            sum += *s;
        }
        for s in scores.iter_mut() {
            *s /= sum;
        }

        let out = &mut output[head * head_dim..(head + 1) * head_dim];
        for (pos, &weight) in scores.iter().enumerate() {
            let v = &values[tile + pos * head_dim..tile + (pos + 1) * head_dim];
            for d in 0..head_dim {
                out[d] += weight * v[d];
            }
        }
    }
    output
}

#[test]
fn one_to_one_grouping_equals_multi_head_attention() {
    // A == G: every query head owns its KV head, which is plain MHA.
    let (num_heads, num_groups, head_dim, seq_len, max_seq_len) = (2usize, 2usize, 4usize, 3usize, 4usize);
    let scale = 1.0 / (head_dim as f32).sqrt();

    let query = pattern(num_heads * head_dim, 0.2);
    let keys = pattern(num_groups * max_seq_len * head_dim, 4.1);
    let values = pattern(num_groups * max_seq_len * head_dim, 9.4);

    let expected = reference_attention(
        &query, &keys, &values, num_heads, num_groups, head_dim, seq_len, max_seq_len, scale,
    );

    let mut actual = query.clone();
    gqa_forward(
        &mut actual, &keys, &values, num_heads, num_groups, head_dim, seq_len, max_seq_len, scale,
    )
    .unwrap();

    for (e, a) in expected.iter().zip(actual.iter()) {
        assert!((e - a).abs() <= MAX_ABS, "{e} vs {a}");
    }
}

#[test]
fn shared_groups_match_reference() {
    // Four query heads over two KV groups.
    let (num_heads, num_groups, head_dim, seq_len, max_seq_len) = (4usize, 2usize, 8usize, 5usize, 8usize);
    let scale = 1.0 / (head_dim as f32).sqrt();

    let query = pattern(num_heads * head_dim, 2.5);
    let keys = pattern(num_groups * max_seq_len * head_dim, 6.0);
    let values = pattern(num_groups * max_seq_len * head_dim, 3.3);

    let expected = reference_attention(
        &query, &keys, &values, num_heads, num_groups, head_dim, seq_len, max_seq_len, scale,
    );

    let mut actual = query.clone();
    gqa_forward(
        &mut actual, &keys, &values, num_heads, num_groups, head_dim, seq_len, max_seq_len, scale,
    )
    .unwrap();

    for (e, a) in expected.iter().zip(actual.iter()) {
        assert!((e - a).abs() <= MAX_ABS, "{e} vs {a}");
    }
}

#[test]
fn single_position_attends_only_to_itself() {
    // With one cached row the softmax is a delta: output = value row.
    let (num_heads, num_groups, head_dim, max_seq_len) = (2usize, 1usize, 4usize, 4usize);
    let query = pattern(num_heads * head_dim, 1.0);
    let keys = pattern(num_groups * max_seq_len * head_dim, 2.0);
    let values = pattern(num_groups * max_seq_len * head_dim, 3.0);

    let mut actual = query.clone();
    gqa_forward(&mut actual, &keys, &values, num_heads, num_groups, head_dim, 1, max_seq_len, 0.5)
        .unwrap();

    for head in 0..num_heads {
        for d in 0..head_dim {
            assert!((actual[head * head_dim + d] - values[d]).abs() <= MAX_ABS);
        }
    }
}

#[test]
fn rejects_contract_violations() {
    let mut query = vec![0.0f32; 3 * 4];
    let keys = vec![0.0f32; 2 * 4 * 4];
    let values = vec![0.0f32; 2 * 4 * 4];

    // 3 heads cannot split into 2 groups.
    assert!(matches!(
        gqa_forward(&mut query, &keys, &values, 3, 2, 4, 2, 4, 0.5),
        Err(EngineError::Shape(_))
    ));

    // Sequence longer than the cache tile.
    let mut query = vec![0.0f32; 2 * 4];
    assert!(matches!(
        gqa_forward(&mut query, &keys, &values, 2, 2, 4, 5, 4, 0.5),
        Err(EngineError::Shape(_))
    ));

    // Query buffer of the wrong size.
    let mut short = vec![0.0f32; 7];
    assert!(matches!(
        gqa_forward(&mut short, &keys, &values, 2, 2, 4, 2, 4, 0.5),
        Err(EngineError::Shape(_))
    ));
}
