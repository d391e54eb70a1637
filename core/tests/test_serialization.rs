/// Checkpoint and export round-trip tests.
///
/// Verifies that config/param structs survive JSON serialization and that a
/// saved-then-loaded model evaluates to exactly the same report line.


use fixtures::{make_config, make_phi, make_sequences};
use gated_loglin_core::error::LearnerError;
use gated_loglin_core::eval::evaluate;
use gated_loglin_core::learner::GatedLogLinear;
use gated_loglin_core::model::{
    GatedConfig, GatedParams, export_params, import_params, load_checkpoint, save_checkpoint,
};
use gated_loglin_core::optimizer::{OptimizerState, UpdateRule};
use gated_loglin_core::tensor::Precision;

// ── Helpers ──────────────────────────────────────────────────────────

fn assert_params_eq(a: &GatedParams, b: &GatedParams) {
    assert_eq!(a.retain.w_l1, b.retain.w_l1, "retain.w_l1 mismatch");
    assert_eq!(a.retain.w_l2, b.retain.w_l2, "retain.w_l2 mismatch");
    assert_eq!(a.retain.w_x, b.retain.w_x, "retain.w_x mismatch");
    assert_eq!(a.retain.b, b.retain.b, "retain.b mismatch");
    assert_eq!(a.update.w_l1, b.update.w_l1, "update.w_l1 mismatch");
    assert_eq!(a.update.w_l2, b.update.w_l2, "update.w_l2 mismatch");
    assert_eq!(a.update.w_x, b.update.w_x, "update.w_x mismatch");
    assert_eq!(a.update.b, b.update.b, "update.b mismatch");
}

fn trained_model(precision: Precision) -> (GatedLogLinear, gated_loglin_core::features::FeatureTensor, Vec<gated_loglin_core::recurrence::Sequence>) {
    let mut cfg = make_config(8, 4, 5, 3);
    cfg.precision = precision;
    let phi = make_phi(&cfg, 3, 31);
    let seqs = make_sequences(&cfg, 4, 6, 500);
    let mut model = GatedLogLinear::new(cfg).unwrap();
    let theta_0 = vec![0.0; 8];
    for seq in &seqs {
        model.update(&phi, &seq.steps, &theta_0, 0.01).unwrap();
    }
    (model, phi, seqs)
}

// ── Config ───────────────────────────────────────────────────────────

#[test]
fn test_config_roundtrip() {
    let cfg = GatedConfig::for_dims(100, 12, 4000);
    let json = serde_json::to_string_pretty(&cfg).unwrap();
    let restored: GatedConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(cfg, restored);
}

#[test]
fn test_config_from_json_file_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg.json");
    let mut cfg = GatedConfig::test_config();
    cfg.low_rank_dim = 0;
    std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
    assert!(matches!(GatedConfig::from_json_file(&path), Err(LearnerError::Config(_))));
}

// ── Checkpoint ───────────────────────────────────────────────────────

#[test]
fn test_checkpoint_roundtrip_free_functions() {
    let cfg = GatedConfig::test_config();
    let params = GatedParams::init(&cfg);
    let lens: Vec<usize> = params.buffers().iter().map(|b| b.len()).collect();
    let opt = OptimizerState::new(UpdateRule::rmsprop(), &lens);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ckpt.json");
    save_checkpoint(&path, &cfg, &params, &opt).unwrap();
    let (cfg2, params2, opt2) = load_checkpoint(&path).unwrap();
    assert_eq!(cfg, cfg2);
    assert_params_eq(&params, &params2);
    assert_eq!(opt, opt2);
}

#[test]
fn test_save_load_identical_evaluation() {
    for precision in [Precision::Single, Precision::Double] {
        let (model, phi, seqs) = trained_model(precision);
        let theta_0 = vec![0.0; 8];
        let before = evaluate(&model, &phi, &seqs, &theta_0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.save(&path).unwrap();
        let loaded = GatedLogLinear::load(&path).unwrap();

        assert_params_eq(model.params(), loaded.params());
        assert_eq!(model.optimizer(), loaded.optimizer());
        let after = evaluate(&loaded, &phi, &seqs, &theta_0).unwrap();
        assert_eq!(format!("dev: {before}"), format!("dev: {after}"));
        assert_eq!(before, after);
    }
}

#[test]
fn test_loaded_model_continues_training_identically() {
    let (mut model, phi, seqs) = trained_model(Precision::Double);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    model.save(&path).unwrap();
    let mut loaded = GatedLogLinear::load(&path).unwrap();

    let theta_0 = vec![0.0; 8];
    model.update(&phi, &seqs[0].steps, &theta_0, 0.01).unwrap();
    loaded.update(&phi, &seqs[0].steps, &theta_0, 0.01).unwrap();
    assert_params_eq(model.params(), loaded.params());
}

#[test]
fn test_corrupt_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{\"config\": 3}").unwrap();
    assert!(matches!(GatedLogLinear::load(&path), Err(LearnerError::Serialization(_))));
    let missing = dir.path().join("missing.json");
    assert!(matches!(GatedLogLinear::load(&missing), Err(LearnerError::Io(_))));
}

// ── Export ───────────────────────────────────────────────────────────

#[test]
fn test_export_import_roundtrip() {
    let (mut model, _, _) = trained_model(Precision::Double);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("params.json");
    model.export_params(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"retain.w_l1\""));
    assert!(text.contains('\n'), "export should be pretty-printed");

    let exported = model.params().clone();
    model.set_params(GatedParams::zeros_like(model.config())).unwrap();
    model.import_params(&path).unwrap();
    assert_params_eq(&exported, model.params());
}

#[test]
fn test_import_shape_mismatch() {
    let cfg = make_config(8, 4, 5, 3);
    let params = GatedParams::init(&cfg);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("params.json");
    export_params(&path, &cfg, &params).unwrap();

    let other = make_config(8, 4, 5, 2);
    let err = import_params(&path, &other).unwrap_err();
    assert!(matches!(err, LearnerError::Config(_)));
}
