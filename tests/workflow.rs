use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use assetsync::api::{CreateAssetRequest, InstallScope, PublishRequest, StorageType};
use assetsync::links::{LinkRegistry, LinkSet};
use assetsync::server::{self, AppState, Unlimited};
use assetsync::sync::{
    self, ApiClient, AssetOutcome, LinkStatus, NoHook, PullOptions, PushOptions, SyncEngine,
};
use assetsync::{content_hash, Database, SyncAction};
use filetime::FileTime;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const TOKEN: &str = "integration-token";

struct World {
    _dir: TempDir,
    db: Database,
    user: String,
    asset: String,
    machine: String,
    file: PathBuf,
    links: LinkSet,
    engine: SyncEngine<ApiClient>,
    server: JoinHandle<()>,
}

impl Drop for World {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl World {
    fn entry(&self) -> assetsync::LinkEntry {
        self.links.find(&self.asset).unwrap().1
    }

    fn publish(&self, version: &str, content: &str) {
        self.db
            .publish_version(
                &self.user,
                &self.asset,
                &PublishRequest {
                    version: version.into(),
                    content: Some(content.into()),
                    changelog: None,
                },
            )
            .unwrap();
    }

    async fn pull(&mut self) -> Result<Option<AssetOutcome>> {
        let summary = self
            .engine
            .pull(&mut self.links, &PullOptions::default(), &NoHook)
            .await?;
        Ok(summary.outcome(&self.asset).cloned())
    }
}

fn set_mtime(path: &std::path::Path, offset_secs: i64) {
    let base = SystemTime::now();
    let at = if offset_secs >= 0 {
        base + Duration::from_secs(offset_secs as u64)
    } else {
        base - Duration::from_secs(offset_secs.unsigned_abs())
    };
    filetime::set_file_mtime(path, FileTime::from_system_time(at)).unwrap();
}

/// A running server with one inline asset at 1.0.0, and a registered client
/// that has linked it but never synced.
async fn world() -> Result<World> {
    let dir = TempDir::new()?;
    let db = Database::open_in_memory()?;
    let user = db.ensure_user(TOKEN)?;
    let asset = db
        .create_asset(
            &user,
            &CreateAssetRequest {
                slug: "code-reviewer".into(),
                name: Some("Code Reviewer".into()),
                content: Some("# Reviewer\nv1\n".into()),
                storage_type: StorageType::Inline,
                install_scope: InstallScope::User,
                primary_file_name: "SKILL.md".into(),
                bundle_url: None,
                version: None,
            },
        )?
        .id;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(db.clone(), Arc::new(Unlimited));
    let server = tokio::spawn(async move {
        let _ = server::serve_with_listener(listener, state).await;
    });

    let client = ApiClient::new(
        &format!("http://{addr}"),
        Some(TOKEN.into()),
        Duration::from_secs(5),
    )?;
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work)?;
    let mut links = LinkSet::load(LinkRegistry::new(dir.path().join("home")), &work);

    let machine = sync::register_machine(&client, &mut links, Some("laptop".into()))
        .await?
        .id;
    let engine = SyncEngine::new(client, machine.clone());

    let file = work.join("skills").join("SKILL.md");
    engine
        .link(&mut links, "code-reviewer", Some(file.clone()))
        .await?;

    Ok(World {
        _dir: dir,
        db,
        user,
        asset,
        machine,
        file,
        links,
        engine,
        server,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn never_synced_link_is_pulled_and_reported() -> Result<()> {
    let mut w = world().await?;
    assert!(w.entry().never_synced());

    let outcome = w.pull().await?;
    assert_eq!(
        outcome,
        Some(AssetOutcome::Pulled {
            version: "1.0.0".into(),
            action: SyncAction::Pull,
        })
    );

    let written = std::fs::read_to_string(&w.file)?;
    assert_eq!(written, "# Reviewer\nv1\n");
    let entry = w.entry();
    assert_eq!(entry.last_synced_version, "1.0.0");
    assert_eq!(entry.last_hash, content_hash(&written));

    let ledger = w.db.sync_state(&w.user, &w.machine, &w.asset)?.unwrap();
    assert_eq!(ledger.synced_version, "1.0.0");
    assert_eq!(ledger.local_hash, Some(content_hash(&written)));
    assert!(ledger.last_pull_at.is_some());
    assert!(ledger.last_push_at.is_none());

    // The link survives a reload from disk
    w.links.reload();
    assert_eq!(w.entry().last_synced_version, "1.0.0");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_edit_is_pushed_and_bumps_patch() -> Result<()> {
    let mut w = world().await?;
    w.pull().await?;

    std::fs::write(&w.file, "# Reviewer\nv2\n")?;
    let summary = w
        .engine
        .push(&mut w.links, &PushOptions::default())
        .await?;
    assert_eq!(
        summary.outcome(&w.asset),
        Some(&AssetOutcome::Pushed {
            version: "1.0.1".into()
        })
    );

    let entry = w.entry();
    assert_eq!(entry.last_synced_version, "1.0.1");
    assert_eq!(entry.last_hash, content_hash("# Reviewer\nv2\n"));

    let content = w.db.asset_content(&w.user, &w.asset)?;
    assert_eq!(content.version, "1.0.1");
    assert_eq!(content.content.as_deref(), Some("# Reviewer\nv2\n"));

    let history = w.db.versions(&w.user, &w.asset)?;
    assert!(history.iter().any(|v| v.version == "1.0.0"));

    let ledger = w.db.sync_state(&w.user, &w.machine, &w.asset)?.unwrap();
    assert_eq!(ledger.synced_version, "1.0.1");
    assert!(ledger.last_push_at.is_some());

    // A second push with nothing changed is a no-op
    let again = w
        .engine
        .push(&mut w.links, &PushOptions::default())
        .await?;
    assert_eq!(again.outcome(&w.asset), Some(&AssetOutcome::Unchanged));
    assert_eq!(w.db.asset_content(&w.user, &w.asset)?.version, "1.0.1");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_local_edit_wins_conflict_and_is_left_alone() -> Result<()> {
    let mut w = world().await?;
    w.pull().await?;

    w.publish("1.1.0", "# Reviewer\nserver\n");
    std::fs::write(&w.file, "# Reviewer\nlocal\n")?;
    set_mtime(&w.file, 3600);

    let statuses = w.engine.status(&w.links).await?;
    assert_eq!(statuses[0].status, LinkStatus::Action(SyncAction::ConflictPush));

    let outcome = w.pull().await?;
    assert_eq!(
        outcome,
        Some(AssetOutcome::Conflict {
            action: SyncAction::ConflictPush
        })
    );
    assert_eq!(std::fs::read_to_string(&w.file)?, "# Reviewer\nlocal\n");
    assert_eq!(w.entry().last_synced_version, "1.0.0");

    // A one-shot sync also refuses to overwrite or push on its own
    let summary = w.engine.sync(&mut w.links, &NoHook).await?;
    assert_eq!(summary.conflicts(), 1);
    assert_eq!(w.db.asset_content(&w.user, &w.asset)?.version, "1.1.0");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_local_edit_is_overwritten_by_server() -> Result<()> {
    let mut w = world().await?;
    w.pull().await?;

    std::fs::write(&w.file, "# Reviewer\nstale\n")?;
    set_mtime(&w.file, -3600);
    w.publish("1.1.0", "# Reviewer\nserver\n");

    let summary = w.engine.sync(&mut w.links, &NoHook).await?;
    assert_eq!(
        summary.outcome(&w.asset),
        Some(&AssetOutcome::Pulled {
            version: "1.1.0".into(),
            action: SyncAction::ConflictPull,
        })
    );
    assert_eq!(std::fs::read_to_string(&w.file)?, "# Reviewer\nserver\n");
    assert_eq!(w.entry().last_synced_version, "1.1.0");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_token_is_rejected() -> Result<()> {
    let w = world().await?;
    let client = ApiClient::new(
        w.engine.remote().base_url().as_str(),
        Some("wrong".into()),
        Duration::from_secs(5),
    )?;
    let engine = SyncEngine::new(client, w.machine.clone());

    let err = engine.status(&w.links).await.unwrap_err();
    assert!(matches!(
        err,
        assetsync::SyncError::Remote { status: 401, .. }
    ));
    Ok(())
}
