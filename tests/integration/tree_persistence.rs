use std::path::Path;

use bpdict::{
    BPlusTree, CachePolicy, CreatePolicy, Result, StorageKind, TreeConfig, TreeError, TreeOptions,
};
use tempfile::tempdir;

fn disk_config(path: &Path, policy: CreatePolicy) -> Result<TreeConfig> {
    let mut config = TreeConfig::disk(path);
    config.set_create_policy(policy)?;
    config.set_btree_order(16)?;
    config.set_block_size(1024)?;
    config.set_file_growth_rate(8)?;
    Ok(config)
}

fn open(config: TreeConfig) -> Result<BPlusTree<String, u64>> {
    BPlusTree::open(TreeOptions::new(config))
}

#[test]
fn reopened_file_keeps_entries_and_shape() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let path = dir.path().join("words.bpd");
    let before = {
        let tree = open(disk_config(&path, CreatePolicy::IfNeeded)?)?;
        for n in 0u64..1_500 {
            tree.insert(format!("key-{n:05}"), n)?;
        }
        for n in (0u64..1_500).filter(|n| n % 5 == 0) {
            tree.remove(&format!("key-{n:05}"))?;
        }
        tree.update(&format!("key-{:05}", 7), 7_000)?;
        tree.flush()?;
        tree.validate()?
    };

    let tree = open(disk_config(&path, CreatePolicy::Never)?)?;
    assert_eq!(tree.validate()?, before);
    assert_eq!(before.entries, 1_200);
    assert_eq!(tree.get(&"key-00007".to_owned())?, 7_000);
    assert_eq!(tree.try_get(&"key-00010".to_owned())?, None);
    let first: Vec<String> = tree.keys().take(3).collect::<Result<_>>()?;
    assert_eq!(first, ["key-00001", "key-00002", "key-00003"]);
    Ok(())
}

#[test]
fn create_policies_control_the_backing_file() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let path = dir.path().join("policy.bpd");

    assert!(open(disk_config(&path, CreatePolicy::Never)?).is_err());
    assert!(!path.exists());

    {
        let tree = open(disk_config(&path, CreatePolicy::IfNeeded)?)?;
        tree.insert("kept".to_owned(), 1)?;
        tree.flush()?;
    }
    {
        let tree = open(disk_config(&path, CreatePolicy::IfNeeded)?)?;
        assert_eq!(tree.get(&"kept".to_owned())?, 1);
    }
    let tree = open(disk_config(&path, CreatePolicy::Always)?)?;
    assert_eq!(tree.try_get(&"kept".to_owned())?, None);
    assert_eq!(tree.validate()?.entries, 0);
    Ok(())
}

#[test]
fn read_only_tree_serves_reads_and_rejects_writes() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let path = dir.path().join("frozen.bpd");
    {
        let tree = open(disk_config(&path, CreatePolicy::IfNeeded)?)?;
        for n in 0u64..100 {
            tree.insert(format!("k{n:03}"), n)?;
        }
    }

    let mut config = disk_config(&path, CreatePolicy::Never)?;
    config.set_read_only(true)?;
    config.set_cache_policy(CachePolicy::None);
    let tree = open(config)?;
    assert_eq!(tree.get(&"k042".to_owned())?, 42);
    assert_eq!(tree.iter().count(), 100);
    assert!(matches!(tree.remove(&"k042".to_owned()), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.update(&"k001".to_owned(), 9), Err(TreeError::ReadOnly)));
    assert_eq!(tree.get(&"k001".to_owned())?, 1);
    Ok(())
}

#[test]
fn read_only_requires_an_existing_file() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let mut config = disk_config(&dir.path().join("absent.bpd"), CreatePolicy::IfNeeded)?;
    assert!(config.set_read_only(true).is_err());
    config.set_create_policy(CreatePolicy::Never)?;
    config.set_read_only(true)?;
    assert!(open(config).is_err());
    Ok(())
}

#[test]
fn config_file_round_trip_opens_the_same_tree() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let path = dir.path().join("configured.bpd");
    let source = format!(
        r#"
storage = "disk"
file_name = {path:?}
create_policy = "if_needed"
block_size = 2048
cache_policy = "recent"
keep_alive_max_history = 64
"#,
        path = path.display().to_string()
    );
    let config = TreeConfig::from_toml_str(&source)?;
    assert_eq!(config.storage(), StorageKind::Disk);
    assert_eq!(config.block_size(), 2048);

    {
        let tree = open(config.clone())?;
        tree.insert("a".to_owned(), 1)?;
    }
    let again = TreeConfig::from_toml_str(&config.to_toml_string()?)?;
    assert_eq!(again, config);
    let tree = open(again)?;
    assert_eq!(tree.get(&"a".to_owned())?, 1);
    Ok(())
}

#[test]
fn clear_frees_file_blocks_for_reuse() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let path = dir.path().join("cleared.bpd");
    let tree = open(disk_config(&path, CreatePolicy::IfNeeded)?)?;
    for n in 0u64..500 {
        tree.insert(format!("{n:04}"), n)?;
    }
    tree.flush()?;
    let grown = std::fs::metadata(&path).map_err(TreeError::Io)?.len();
    tree.clear()?;
    for n in 0u64..500 {
        tree.insert(format!("{n:04}"), n)?;
    }
    tree.flush()?;
    let regrown = std::fs::metadata(&path).map_err(TreeError::Io)?.len();
    assert!(regrown <= grown, "{regrown} > {grown}");
    assert_eq!(tree.validate()?.entries, 500);
    Ok(())
}
