//! Unit tests for autograd operations (forward and backward)

use super::test_utils::GradientCheck;
use crate::autograd::{
    add, backward, concat_cols, dropout, gather_rows, layer_norm_rows, linear, mask_columns, relu,
    Tensor,
};
use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_tensor_creation() {
    let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
    assert_eq!(t.len(), 3);
    assert!(t.requires_grad());
    assert!(t.grad().is_none());
}

#[test]
fn test_tensor_grad_accumulation() {
    let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);

    t.accumulate_grad(ndarray::arr1(&[1.0, 1.0, 1.0]));
    t.accumulate_grad(ndarray::arr1(&[1.0, 1.0, 1.0]));
    let grad = t.grad().expect("gradient should be available");
    assert_eq!(grad[0], 2.0);

    t.zero_grad();
    assert!(t.grad().is_none());
}

#[test]
fn test_clone_shares_gradient_cell() {
    let t = Tensor::from_vec(vec![1.0], true);
    let c = t.clone();
    c.accumulate_grad(ndarray::arr1(&[3.0]));
    assert_eq!(t.grad().expect("shared grad")[0], 3.0);

    let d = t.detach();
    assert!(!d.requires_grad());
    assert!(d.grad().is_none());
}

#[test]
fn test_add_backward() {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
    let b = Tensor::from_vec(vec![4.0, 5.0, 6.0], true);
    let mut c = add(&a, &b);

    backward(&mut c, Some(ndarray::arr1(&[1.0, 1.0, 1.0])));

    assert_abs_diff_eq!(a.grad().expect("grad a")[0], 1.0);
    assert_abs_diff_eq!(b.grad().expect("grad b")[2], 1.0);
}

#[test]
fn test_shared_intermediate_counts_each_consumer_once() {
    // y = relu(2x) + 2x through one shared node: dy/dx = 4 for x > 0
    let x = Tensor::from_vec(vec![1.0, 0.5], true);
    let shared = add(&x, &x);
    let mut y = add(&relu(&shared), &shared);

    backward(&mut y, None);

    let grad = x.grad().expect("grad x");
    assert_abs_diff_eq!(grad[0], 4.0, epsilon = 1e-6);
    assert_abs_diff_eq!(grad[1], 4.0, epsilon = 1e-6);
}

#[test]
fn test_linear_backward_matches_finite_difference() {
    let w = Tensor::from_vec(vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6], false);
    let b = Tensor::from_vec(vec![0.0, 1.0], false);
    let check = GradientCheck::run(&[0.5, -1.0, 2.0, 0.25, 1.5, -0.75], 1e-3, |x| linear(x, &w, &b, 2, 3));
    check.assert_within(1e-2);
}

#[test]
fn test_gradient_check_of_constant_output_is_zero() {
    let check = GradientCheck::run(&[1.0, 2.0], 1e-3, |_| Tensor::from_vec(vec![3.0], false));
    assert_eq!(check.analytic, vec![0.0, 0.0]);
    assert_eq!(check.worst().1, 0.0);
}

#[test]
fn test_layer_norm_rows_normalizes_each_row() {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0], false);
    let gamma = Tensor::ones(3, false);
    let beta = Tensor::zeros(3, false);
    let y = layer_norm_rows(&x, &gamma, &beta, 2, 3, 1e-12);

    for r in 0..2 {
        let row = &y.data().as_slice().expect("contiguous")[r * 3..(r + 1) * 3];
        let mean: f32 = row.iter().sum::<f32>() / 3.0;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
    }
    // Both rows are affine images of each other, so they normalize identically
    assert_abs_diff_eq!(y.data()[0], y.data()[3], epsilon = 1e-5);
}

#[test]
fn test_gather_rows_scatters_gradient() {
    // 3 rows of width 2
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], true);
    let mut g = gather_rows(&x, &[2, 0, 2], 2);
    assert_eq!(g.data().to_vec(), vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);

    backward(&mut g, None);
    assert_eq!(
        x.grad().expect("grad").to_vec(),
        vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]
    );
}

#[test]
fn test_concat_cols_interleaves_rows_and_splits_gradient() {
    let a = Tensor::from_vec(vec![1.0, 2.0], true); // [2, 1]
    let b = Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0], true); // [2, 2]
    let mut c = concat_cols(&[(&a, 1), (&b, 2)], 2);
    assert_eq!(c.data().to_vec(), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

    backward(
        &mut c,
        Some(ndarray::arr1(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
    );
    assert_eq!(a.grad().expect("grad a").to_vec(), vec![1.0, 4.0]);
    assert_eq!(b.grad().expect("grad b").to_vec(), vec![2.0, 3.0, 5.0, 6.0]);
}

#[test]
fn test_mask_columns_zeroes_inactive_classes() {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], true);
    let mut y = mask_columns(&x, &[1.0, 0.0, 1.0]);
    assert_eq!(y.data().to_vec(), vec![1.0, 0.0, 3.0, 4.0, 0.0, 6.0]);

    backward(&mut y, None);
    assert_eq!(
        x.grad().expect("grad").to_vec(),
        vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0]
    );
}

#[test]
fn test_dropout_keep_all_is_identity() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
    let y = dropout(&x, 1.0, &mut rng);
    assert_eq!(y.data().to_vec(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_dropout_scales_survivors() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::ones(1000, false);
    let y = dropout(&x, 0.5, &mut rng);
    for &v in y.data() {
        assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
    }
    let kept = y.data().iter().filter(|&&v| v > 0.0).count();
    assert!((400..600).contains(&kept), "kept {kept}");
}
