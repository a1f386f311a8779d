//! Configuration loading, validation and run planning from files

use multitarea::config::{validate_config, MultitaskConfig, RunParams, RunPlan};
use multitarea::{MultitaskError, ObjectiveComposer};
use std::io::Write;
use tempfile::NamedTempFile;

const YAML: &str = r#"
problem: "WeiboNER&WeiboFakeCLS|WeiboPretrain"
problems:
  NER: { kind: seq_tag, num_classes: 10 }
  WeiboNER: { kind: seq_tag, num_classes: 10, share_top: NER }
  WeiboFakeCLS: { kind: cls, num_classes: 2 }
  WeiboPretrain: { kind: pretrain, num_classes: 2 }
label_transfer: true
training:
  batch_size: 16
  train_epoch: 1
  dupe_factor: 5
  data_num: { WeiboNER: 1000, WeiboFakeCLS: 600, WeiboPretrain: 400 }
"#;

fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write");
    file
}

#[test]
fn test_load_yaml_and_build_composer() {
    let file = write_temp(".yaml", YAML);
    let config = MultitaskConfig::load(file.path()).expect("loads");
    assert!(config.label_transfer);
    let composer = ObjectiveComposer::from_config(&config).expect("builds");
    assert_eq!(composer.groups().len(), 2);
    assert!(composer.transfer().is_some());
    assert_eq!(composer.registry().effective_identity("WeiboNER").expect("known"), "NER");
}

#[test]
fn test_json_config_loads_by_extension() {
    let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
    let json = serde_json::to_string(&config).expect("serializes");
    let file = write_temp(".json", &json);
    assert_eq!(MultitaskConfig::load(file.path()).expect("loads"), config);
}

#[test]
fn test_run_plan_for_mixed_configuration() {
    let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
    let plan = RunPlan::new(&config, 1, None, None).expect("plans");
    assert_eq!(plan.data_num, 2000);
    // pretraining present: 2000 * 1 * 5 / 16
    assert_eq!(plan.train_steps, 625);
    assert_eq!(plan.warmup_steps, 62);
    assert_eq!(
        plan.ckpt_dir,
        std::path::PathBuf::from("tmp/WeiboFakeCLS_WeiboNER_WeiboPretrain_ckpt")
    );
    let total: f64 = plan.group_weights.iter().sum();
    assert!((total - 1.0).abs() < 1e-12);
}

#[test]
fn test_params_dump_restores_groups() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
    let plan = RunPlan::new(&config, 2, Some(dir.path()), Some("run")).expect("plans");
    let path = plan.save_params(&config).expect("saves");
    let restored = RunParams::load(path).expect("loads");
    assert_eq!(restored.groups, plan.groups);
    assert_eq!(restored.config, config);
}

#[test]
fn test_cyclic_share_fails_before_any_step() {
    let yaml = YAML.replace(
        "NER: { kind: seq_tag, num_classes: 10 }",
        "NER: { kind: seq_tag, num_classes: 10, share_top: WeiboNER }",
    );
    let config = MultitaskConfig::from_yaml_str(&yaml).expect("parses");
    let err = validate_config(&config).unwrap_err();
    assert!(matches!(err, MultitaskError::CyclicShare { .. }));
    assert!(err.is_configuration_error());
    assert!(ObjectiveComposer::from_config(&config).is_err());
}

#[test]
fn test_empty_expression_rejected() {
    let yaml = YAML.replace("WeiboNER&WeiboFakeCLS|WeiboPretrain", "");
    let config = MultitaskConfig::from_yaml_str(&yaml).expect("parses");
    assert!(matches!(
        validate_config(&config).unwrap_err(),
        MultitaskError::EmptyExpression { .. }
    ));
}

#[test]
fn test_incompatible_share_fails_before_any_step() {
    let yaml = YAML.replace(
        "WeiboFakeCLS: { kind: cls, num_classes: 2 }",
        "WeiboFakeCLS: { kind: cls, num_classes: 10, share_top: NER }",
    );
    let config = MultitaskConfig::from_yaml_str(&yaml).expect("parses");
    let err = validate_config(&config).unwrap_err();
    assert!(matches!(
        err,
        MultitaskError::InvalidConfig { ref field, .. } if field == "problems.WeiboFakeCLS.share_top"
    ));
    assert!(RunPlan::new(&config, 1, None, None).is_err());
    assert!(ObjectiveComposer::from_config(&config).is_err());
}
