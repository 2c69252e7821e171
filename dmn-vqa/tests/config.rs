use anyhow::Result;
use dmn_vqa::backbone::Backbone;
use dmn_vqa::config::{AttentionMechanism, Config, MemoryUpdate, Solver};

fn write_config(dir: &tempfile::TempDir, content: &str) -> Result<std::path::PathBuf> {
    let path = dir.path().join("config.json");
    std::fs::write(&path, content)?;
    Ok(path)
}

#[test]
fn defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(&dir, r#"{"num_words": 1000}"#)?;
    let cfg = Config::from_json_file(&path)?;
    assert_eq!(cfg.num_words, 1000);
    assert_eq!(cfg.backbone, Backbone::Vgg16);
    assert_eq!(cfg.image_size, 224);
    assert!(!cfg.train_cnn);
    assert!(cfg.batch_norm);
    assert_eq!((cfg.dim_hidden, cfg.dim_embed, cfg.max_ques_len), (512, 300, 30));
    assert_eq!(cfg.memory_step, 3);
    assert_eq!(cfg.memory_update, MemoryUpdate::Gru);
    assert_eq!(cfg.attention, AttentionMechanism::Soft);
    assert!(cfg.tie_memory_weight);
    assert_eq!(cfg.memory_dropout, 0.5);
    assert_eq!(cfg.solver, Solver::Adam);
    assert_eq!(cfg.clip_gradients, 3.);
    assert_eq!(cfg.feature_grid()?.len(), 196);
    Ok(())
}

#[test]
fn overrides() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        &dir,
        r#"{
            "num_words": 20,
            "backbone": "resnet_cifar10",
            "image_size": 32,
            "memory_update": "concat",
            "attention": "gru",
            "solver": "rmsprop",
            "tie_memory_weight": false
        }"#,
    )?;
    let cfg = Config::from_json_file(&path)?;
    assert_eq!(cfg.backbone, Backbone::ResnetCifar10);
    assert_eq!(cfg.memory_update, MemoryUpdate::Concat);
    assert_eq!(cfg.attention, AttentionMechanism::Gru);
    assert_eq!(cfg.solver, Solver::Rmsprop);
    assert!(!cfg.tie_memory_weight);
    assert_eq!(cfg.feature_grid()?.len(), 64);
    Ok(())
}

#[test]
fn invalid_configs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for content in [
        r#"{"num_words": 0}"#,
        r#"{"num_words": 10, "dim_hidden": 0}"#,
        r#"{"num_words": 10, "memory_dropout": 1.0}"#,
        r#"{"num_words": 10, "clip_gradients": 0.0}"#,
        r#"{"num_words": 10, "backbone": "resnet_cifar10", "image_size": 30}"#,
        r#"{"num_words": 10, "solver": "adagrad"}"#,
        r#"{"backbone": "vgg16"}"#,
    ] {
        let path = write_config(&dir, content)?;
        assert!(Config::from_json_file(&path).is_err(), "{content}");
    }
    assert!(Config::tiny(5).validate().is_ok());
    Ok(())
}
