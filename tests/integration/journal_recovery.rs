use std::fs;
use std::path::Path;

use bpdict::primitives::journal::{EntryKind, JournalFactory};
use bpdict::storage::store::{FileStore, FileStoreOptions};
use bpdict::{BPlusTree, CreatePolicy, NodeStorage, Result, TreeConfig, TreeError, TreeOptions};
use tempfile::tempdir;

fn journaled_config(file: &Path, journals: &Path) -> Result<TreeConfig> {
    let mut config = TreeConfig::disk(file);
    config.set_btree_order(8)?;
    config.set_block_size(512)?;
    config.set_journal_dir(Some(journals.to_path_buf()));
    config.set_journal_streams(2)?;
    Ok(config)
}

fn journal_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("transaction.") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[test]
fn journaled_tree_leaves_nothing_to_recover() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let file = dir.path().join("tree.bpd");
    let journals = dir.path().join("journal");
    {
        let tree: BPlusTree<u64, u64> =
            BPlusTree::open(TreeOptions::new(journaled_config(&file, &journals)?))?;
        for key in 0u64..300 {
            tree.insert(key, key)?;
        }
        for key in (0u64..300).step_by(2) {
            tree.remove(&key)?;
        }
    }
    assert!(!journal_files(&journals)?.is_empty());

    let factory = JournalFactory::open(&journals, 2)?;
    assert_eq!(factory.pending_recovery(), 0);
    assert!(journal_files(&journals)?.is_empty(), "finished journals are deleted on open");
    drop(factory);

    let tree: BPlusTree<u64, u64> =
        BPlusTree::open(TreeOptions::new(journaled_config(&file, &journals)?))?;
    assert_eq!(tree.validate()?.entries, 150);
    Ok(())
}

#[test]
fn interrupted_transaction_is_rolled_back_on_open() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let file = dir.path().join("tree.bpd");
    let journals = dir.path().join("journal");
    let before = {
        let tree: BPlusTree<u64, String> =
            BPlusTree::open(TreeOptions::new(journaled_config(&file, &journals)?))?;
        for key in 0u64..120 {
            tree.insert(key, format!("v{key}"))?;
        }
        tree.flush()?;
        tree.validate()?
    };

    // Replay by hand what a crash halfway through a commit leaves behind:
    // a journaled allocation and a journaled overwrite of the root.
    {
        let options = FileStoreOptions {
            create_policy: CreatePolicy::Never,
            ..FileStoreOptions::default()
        };
        let store = FileStore::open(&file, &options)?;
        let factory = JournalFactory::open(&journals, 1)?;
        let (root, fresh) = store.open_root()?;
        assert!(!fresh);
        let pre_image = store
            .try_get_node(root)?
            .ok_or(TreeError::Corruption("root missing"))?;

        let mut journal = factory.lease()?;
        let created = store.create()?;
        journal.append(&store, EntryKind::Create, created, &[])?;
        store.write_node(created, b"half-written node")?;
        journal.append(&store, EntryKind::Update, root, &pre_image)?;
        journal.begin_commit()?;
        store.write_node(root, b"torn root")?;
        store.flush()?;
        assert!(journal.rollback_required());
        drop(journal);
        assert_eq!(journal_files(factory.dir())?.len(), 1);
    }

    let tree: BPlusTree<u64, String> =
        BPlusTree::open(TreeOptions::new(journaled_config(&file, &journals)?))?;
    assert_eq!(tree.validate()?, before);
    assert_eq!(tree.get(&77)?, "v77");
    tree.insert(500, "after recovery".to_owned())?;
    assert_eq!(tree.validate()?.entries, 121);
    Ok(())
}

#[test]
fn unreadable_journal_is_quarantined() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let journals = dir.path().join("journal");
    fs::create_dir_all(&journals)?;
    fs::write(journals.join("transaction.001"), [0xffu8; 24])?;

    let factory = JournalFactory::open(&journals, 1)?;
    assert_eq!(factory.pending_recovery(), 0);
    let names: Vec<String> = fs::read_dir(&journals)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .filter(|name| name.as_ref().map_or(true, |name| name.starts_with("transaction.")))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(names, ["transaction.001.corrupt000"]);
    Ok(())
}

#[test]
fn journal_directory_is_exclusive() -> Result<()> {
    let dir = tempdir().map_err(TreeError::Io)?;
    let journals = dir.path().join("journal");
    let first = JournalFactory::open(&journals, 1)?;
    assert!(JournalFactory::open(&journals, 1).is_err());
    drop(first);
    JournalFactory::open(&journals, 1)?;
    Ok(())
}
