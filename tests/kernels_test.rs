//! Kernel contracts against naive references.
//!
//! SIMD reductions reorder floating-point sums, so comparisons use the
//! documented tolerances rather than equality.

use qwen3_infer::kernels::elemwise;
use qwen3_infer::kernels::linear::{linear, linear_with, LinearImpl};
use qwen3_infer::kernels::rmsnorm::{rmsnorm, rmsnorm_inplace, skip_rmsnorm};
use qwen3_infer::kernels::silu::silu;
use qwen3_infer::kernels::softmax::softmax;
use qwen3_infer::EngineError;

const MAX_ABS: f32 = 1e-3;

fn pattern(len: usize, seed: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 * 0.911 + seed).sin() * 0.8))
        .collect()
}

#[test]
fn linear_matches_reference_across_shapes() {
    for &(m, k, n) in &[
        (1usize, 8usize, 8usize),
        (1, 127, 40),
        (1, 1024, 64),
        (4, 96, 25),
        (1, 3, 3),
    ] {
        let input = pattern(m * k, 0.3);
        let weight = pattern(n * k, 7.7);
        let mut expected = vec![0.0; m * n];
        let mut actual = vec![0.0; m * n];
        linear_with(LinearImpl::Naive, &input, &weight, m, k, n, &mut expected).unwrap();
        linear(&input, &weight, m, k, n, &mut actual).unwrap();

        let mut diff_sq = 0.0f32;
        let mut ref_sq = 0.0f32;
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() <= MAX_ABS, "({m},{k},{n}): {e} vs {a}");
            diff_sq += (e - a) * (e - a);
            ref_sq += e * e;
        }
        if ref_sq > 0.0 {
            assert!((diff_sq / ref_sq).sqrt() <= 1e-3);
        }
    }
}

#[test]
fn rmsnorm_unit_rms_before_gain() {
    // With eps = 0 the normalized row must have RMS exactly 1 before gamma.
    let dim = 96;
    let input = pattern(dim, 2.0);
    let gamma = vec![1.0; dim];
    let mut output = vec![0.0; dim];
    rmsnorm(&input, &gamma, &mut output, 1, dim, 0.0).unwrap();

    let rms = (output.iter().map(|x| x * x).sum::<f32>() / dim as f32).sqrt();
    assert!((rms - 1.0).abs() < 1e-4, "rms = {rms}");
}

#[test]
fn rmsnorm_applies_gain_per_row() {
    let dim = 16;
    let rows = 3;
    let input = pattern(rows * dim, 0.5);
    let gamma = pattern(dim, 4.0);
    let mut output = vec![0.0; rows * dim];
    rmsnorm(&input, &gamma, &mut output, rows, dim, 1e-6).unwrap();

    for row in 0..rows {
        let x = &input[row * dim..(row + 1) * dim];
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / dim as f32;
        let denom = 1.0 / (mean_sq + 1e-6).sqrt();
        for i in 0..dim {
            let expected = gamma[i] * x[i] * denom;
            assert!((output[row * dim + i] - expected).abs() <= MAX_ABS);
        }
    }
}

#[test]
fn rmsnorm_inplace_matches_out_of_place() {
    let dim = 24;
    let rows = 2;
    let input = pattern(rows * dim, 9.0);
    let gamma = pattern(dim, 1.2);

    let mut expected = vec![0.0; rows * dim];
    rmsnorm(&input, &gamma, &mut expected, rows, dim, 1e-6).unwrap();

    let mut data = input.clone();
    rmsnorm_inplace(&mut data, &gamma, rows, dim, 1e-6).unwrap();
    for (e, a) in expected.iter().zip(data.iter()) {
        assert!((e - a).abs() <= MAX_ABS);
    }
}

#[test]
fn skip_rmsnorm_matches_add_then_norm() {
    let dim = 40;
    let input = pattern(dim, 0.1);
    let skip = pattern(dim, 5.5);
    let gamma = pattern(dim, 2.2);

    let mut sum = vec![0.0; dim];
    elemwise::add(&input, &skip, &mut sum).unwrap();
    let mut expected = vec![0.0; dim];
    rmsnorm(&sum, &gamma, &mut expected, 1, dim, 1e-6).unwrap();

    let mut fused_norm = vec![0.0; dim];
    let mut fused_sum = vec![0.0; dim];
    skip_rmsnorm(&input, &skip, &gamma, &mut fused_norm, &mut fused_sum, 1e-6).unwrap();

    for i in 0..dim {
        assert!((fused_sum[i] - sum[i]).abs() <= MAX_ABS);
        assert!((fused_norm[i] - expected[i]).abs() <= MAX_ABS);
    }
}

#[test]
fn silu_fixed_points_and_asymptotes() {
    let input = [-10.0f32, 0.0, 10.0];
    let mut output = [0.0f32; 3];
    silu(&input, &mut output).unwrap();

    assert!((output[0] - (-4.54e-4)).abs() < 1e-5, "silu(-10) = {}", output[0]);
    assert_eq!(output[1], 0.0);
    assert!((output[2] - 9.9995).abs() < 1e-3, "silu(10) = {}", output[2]);

    // x >> 0 behaves like identity, x << 0 vanishes.
    let input = [40.0f32, -40.0];
    let mut output = [0.0f32; 2];
    silu(&input, &mut output).unwrap();
    assert!((output[0] - 40.0).abs() < 1e-2);
    assert!(output[1].abs() < 1e-6);
}

#[test]
fn silu_matches_scalar_reference_on_odd_lengths() {
    for len in [1usize, 7, 8, 9, 31, 100] {
        let input = pattern(len, 3.1);
        let mut output = vec![0.0; len];
        silu(&input, &mut output).unwrap();
        for (i, (&x, &y)) in input.iter().zip(output.iter()).enumerate() {
            let expected = x / (1.0 + (-x).exp());
            assert!((y - expected).abs() <= MAX_ABS, "len {len} idx {i}");
        }
    }
}

#[test]
fn softmax_normalizes_and_orders() {
    let mut x = pattern(33, 6.6);
    softmax(&mut x);
    assert!(x.iter().all(|&p| p >= 0.0));
    let sum: f32 = x.iter().sum();
    assert!((sum - 1.0).abs() <= 1e-5, "sum = {sum}");
}

#[test]
fn softmax_survives_large_inputs() {
    let mut x = [1000.0f32, 1001.0, 1002.0];
    softmax(&mut x);
    let expected = [0.0900, 0.2447, 0.6652];
    for (p, e) in x.iter().zip(expected.iter()) {
        assert!((p - e).abs() <= 1e-3, "{p} vs {e}");
    }
    assert!((x.iter().sum::<f32>() - 1.0).abs() <= 1e-5);
}

#[test]
fn softmax_of_constant_input_is_uniform() {
    let mut x = [3.5f32; 16];
    softmax(&mut x);
    for &p in &x {
        assert!((p - 1.0 / 16.0).abs() <= 1e-5);
    }
}

#[test]
fn elemwise_ops_match_reference() {
    for len in [5usize, 64, 1000, 5000] {
        let a = pattern(len, 0.9);
        let b = pattern(len, 8.8);
        let mut sum = vec![0.0; len];
        let mut product = vec![0.0; len];
        elemwise::add(&a, &b, &mut sum).unwrap();
        elemwise::mul(&a, &b, &mut product).unwrap();
        for i in 0..len {
            assert!((sum[i] - (a[i] + b[i])).abs() <= 1e-6);
            assert!((product[i] - a[i] * b[i]).abs() <= 1e-6);
        }
    }
}

#[test]
fn elemwise_rejects_length_mismatch() {
    let a = vec![0.0; 4];
    let b = vec![0.0; 5];
    let mut out = vec![0.0; 4];
    assert!(matches!(
        elemwise::add(&a, &b, &mut out),
        Err(EngineError::Shape(_))
    ));
    assert!(matches!(
        elemwise::mul(&b, &a, &mut out),
        Err(EngineError::Shape(_))
    ));
}
