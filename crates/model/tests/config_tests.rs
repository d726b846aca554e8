use std::fs;

use anyhow::Result;
use model::{BloomConfig, ModelError};
use tempfile::tempdir;

#[test]
fn json_and_toml_configs_load_the_same_model() -> Result<()> {
    let dir = tempdir()?;
    let json = dir.path().join("config.json");
    fs::write(
        &json,
        r#"{"vocab_size": 64, "n_embed": 32, "n_layer": 2, "n_head": 4, "layer_norm_epsilon": 1e-5, "model_type": "bloom"}"#,
    )?;
    let toml = dir.path().join("config.toml");
    fs::write(
        &toml,
        "vocab_size = 64\nhidden_size = 32\nnum_hidden_layers = 2\nnum_attention_heads = 4\n",
    )?;

    let from_json = BloomConfig::from_path(&json)?;
    let from_toml = BloomConfig::from_path(&toml)?;
    assert_eq!(from_json, from_toml);
    assert_eq!(from_json.head_dim(), 8);
    Ok(())
}

#[test]
fn invalid_files_are_reported() -> Result<()> {
    let dir = tempdir()?;
    let yaml = dir.path().join("config.yaml");
    fs::write(&yaml, "vocab_size: 1")?;
    assert!(matches!(
        BloomConfig::from_path(&yaml),
        Err(ModelError::ConfigFormat(_))
    ));

    let bad = dir.path().join("bad.json");
    fs::write(&bad, r#"{"hidden_size": 30, "n_head": 4}"#)?;
    assert!(matches!(
        BloomConfig::from_path(&bad),
        Err(ModelError::InvalidConfig(_))
    ));

    assert!(matches!(
        BloomConfig::from_path(dir.path().join("missing.json")),
        Err(ModelError::Io(_))
    ));
    Ok(())
}
