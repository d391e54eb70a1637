// Finite-difference verification of the hand-derived reverse sweep.
//
// Central differences on the total loss (sequence loss + L2) in double
// precision, compared entry by entry against `sequence_backward` for all
// eight gate tensors.


use fixtures::{make_config, make_phi, make_steps};
use gated_loglin_core::gradient::{check_all_gradients, compute_gradients, fd_single};
use gated_loglin_core::model::{GatedParams, BUFFER_NAMES};
use gated_loglin_core::recurrence::Step;

const FD_EPS: f64 = 1e-5;
const TOL: f64 = 1e-3;

fn assert_all_pass(results: &[(&str, gated_loglin_core::gradient::GradCheck)]) {
    for (name, r) in results {
        assert!(r.checked > 0, "{name}: nothing checked");
        assert!(
            r.all_passed(),
            "{name}: {}/{} passed, max_rel_err={:.3e}",
            r.passed, r.checked, r.max_rel_err
        );
    }
}

#[test]
fn test_gradient_small_model() {
    // D=5, C=3, E=2, k=2, T=4
    let cfg = make_config(5, 3, 2, 2);
    let params = GatedParams::init(&cfg);
    let phi = make_phi(&cfg, 3, 7);
    let steps = make_steps(&cfg, 4, 11);
    let theta_0 = vec![0.1, -0.2, 0.05, 0.3, -0.1];

    let results = check_all_gradients(&params, &cfg, &phi, &steps, &theta_0, 64, FD_EPS, TOL).unwrap();
    assert_eq!(results.len(), BUFFER_NAMES.len());
    assert_all_pass(&results);
}

#[test]
fn test_gradient_feedback_modes() {
    let cfg = make_config(5, 3, 2, 2);
    let params = GatedParams::init(&cfg);
    let phi = make_phi(&cfg, 3, 21);
    let theta_0 = vec![0.2; 5];

    for feedback in [true, false] {
        let steps: Vec<Step> = make_steps(&cfg, 4, 5)
            .into_iter()
            .map(|mut s| {
                s.feedback = feedback;
                s
            })
            .collect();
        let results = check_all_gradients(&params, &cfg, &phi, &steps, &theta_0, 64, FD_EPS, TOL).unwrap();
        assert_all_pass(&results);
    }
}

#[test]
fn test_gradient_without_bias_regularization() {
    let mut cfg = make_config(4, 3, 3, 2);
    cfg.regularize_bias = false;
    cfg.reg = 0.1;
    let mut params = GatedParams::init(&cfg);
    params.retain.b = vec![0.5, -0.5, 1.0, 0.0];
    params.update.b = vec![-1.0, 0.2, 0.3, 0.4];
    let phi = make_phi(&cfg, 2, 3);
    let steps = make_steps(&cfg, 5, 17);
    let theta_0 = vec![0.0; 4];

    let results = check_all_gradients(&params, &cfg, &phi, &steps, &theta_0, 64, FD_EPS, TOL).unwrap();
    assert_all_pass(&results);
}

#[test]
fn test_gradient_longer_unroll() {
    let cfg = make_config(6, 4, 3, 3);
    let params = GatedParams::init(&cfg);
    let phi = make_phi(&cfg, 4, 99);
    let steps = make_steps(&cfg, 12, 100);
    let theta_0 = vec![0.0; 6];

    let results = check_all_gradients(&params, &cfg, &phi, &steps, &theta_0, 16, FD_EPS, TOL).unwrap();
    assert_all_pass(&results);
}

#[test]
fn test_l2_only_gradient_on_empty_sequence() {
    let cfg = make_config(4, 3, 2, 2);
    let params = GatedParams::init(&cfg);
    let phi = make_phi(&cfg, 2, 1);
    let theta_0 = vec![0.0; 4];
    let (loss, grads) = compute_gradients(&params, &cfg, &phi, &[], &theta_0).unwrap();
    assert!((loss - cfg.reg * params.l2_penalty(true)).abs() < 1e-12);
    let fd = fd_single(&params, &cfg, &phi, &[], &theta_0, 0, 1, FD_EPS).unwrap();
    assert!((fd - grads.retain.w_l1[1]).abs() < 1e-8);
}
