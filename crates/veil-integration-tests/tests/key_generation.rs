//! Cold-start key generation scenarios.

use std::os::unix::fs::PermissionsExt;

use veil_relayd::config::Config;
use veil_relayd::server::{Externals, Server};
use veil_relayd::Error;
use veil_types::epoch::EpochTime;

fn generate_only_config(data_dir: &std::path::Path) -> Config {
    Config::parse(&format!(
        r#"
            [server]
            identifier = "mix1"
            data_dir = "{}"
            addresses = ["127.0.0.1:0"]

            [debug]
            generate_only = true
        "#,
        data_dir.display(),
    ))
    .expect("config")
}

#[tokio::test]
async fn cold_start_generate_only_persists_all_keys() {
    let dir = tempfile::tempdir().expect("tempdir");

    let result = Server::new(generate_only_config(dir.path()), Externals::default()).await;
    assert!(
        matches!(result, Err(Error::GenerateOnly)),
        "generate-only must terminate with its dedicated error",
    );

    let epoch = EpochTime::now().epoch;
    for name in [
        "identity.key".to_string(),
        "link.key".to_string(),
        format!("mixkey-{epoch}.db"),
    ] {
        let path = dir.path().join(&name);
        assert!(path.exists(), "{name} must exist after generate-only");
        let mode = std::fs::metadata(&path)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "{name} must be mode 0600");
    }
}

#[tokio::test]
async fn generate_only_is_idempotent_and_keys_are_stable() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = Server::new(generate_only_config(dir.path()), Externals::default()).await;
    assert!(matches!(first, Err(Error::GenerateOnly)));
    let identity_before = std::fs::read(dir.path().join("identity.key")).expect("read identity");
    let link_before = std::fs::read(dir.path().join("link.key")).expect("read link");

    let second = Server::new(generate_only_config(dir.path()), Externals::default()).await;
    assert!(matches!(second, Err(Error::GenerateOnly)));

    assert_eq!(
        std::fs::read(dir.path().join("identity.key")).expect("reread identity"),
        identity_before,
        "identity key must survive a second run",
    );
    assert_eq!(
        std::fs::read(dir.path().join("link.key")).expect("reread link"),
        link_before,
        "link key must survive a second run",
    );
}
