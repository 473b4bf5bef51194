use std::{env, fs};

use vitalis_server::FailurePolicy;
use vitalis_server::config::loader::load_config;

const FLAT_VARS: &[&str] = &[
    "DATABASE_URL",
    "REDIS_HOST",
    "REDIS_PORT",
    "REDIS_DB",
    "REDIS_PASSWORD",
];

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    // Start from a clean slate for the flat variables
    unsafe {
        for var in FLAT_VARS {
            env::remove_var(var);
        }
    }

    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("vitalis.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
shutdown_grace_secs = 3

[database]
url = "postgres://app:secret@db:5432/app"
pool_size = 4

[redis]
host = "cache"
port = 6380
db = 2

[rate_limit]
threshold = 5
window_secs = 60
failure_policy = "fail-open"

[cache]
default_ttl_secs = 30
bypass_prefixes = ["/auth", "/admin"]

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.server.shutdown_grace_secs, 3);
    assert_eq!(cfg.database.pool_size, 4);
    assert_eq!(cfg.redis.url(), "redis://cache:6380/2");
    assert_eq!(cfg.rate_limit.threshold, 5);
    assert_eq!(cfg.rate_limit.failure_policy, FailurePolicy::FailOpen);
    assert_eq!(cfg.cache.default_ttl_secs, 30);
    assert_eq!(cfg.cache.bypass_prefixes, vec!["/auth", "/admin"]);
    assert_eq!(cfg.logging.level, "debug");

    // 2) Nested env override wins over the file
    unsafe {
        env::set_var("VITALIS__RATE_LIMIT__THRESHOLD", "9");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.rate_limit.threshold, 9);
    unsafe {
        env::remove_var("VITALIS__RATE_LIMIT__THRESHOLD");
    }

    // 3) Flat deployment variables override their keys
    unsafe {
        env::set_var("DATABASE_URL", "postgres://ops@primary/app");
        env::set_var("REDIS_HOST", "redis.internal");
        env::set_var("REDIS_PORT", "6390");
        env::set_var("REDIS_DB", "0");
        env::set_var("REDIS_PASSWORD", "hunter2");
    }
    let cfg_flat = load_config(path.to_str()).expect("flat overrides");
    assert_eq!(
        cfg_flat.database.url.as_deref(),
        Some("postgres://ops@primary/app")
    );
    assert_eq!(cfg_flat.redis.url(), "redis://:hunter2@redis.internal:6390/0");
    unsafe {
        for var in FLAT_VARS {
            env::remove_var(var);
        }
    }

    // 4) A missing file falls back to defaults; the database URL is still required
    let missing = dir.path().join("absent.toml");
    let err = load_config(missing.to_str()).expect_err("no database url");
    assert!(err.contains("database.url"), "{err}");

    unsafe {
        env::set_var("DATABASE_URL", "postgres://localhost/vitalis");
    }
    let defaults = load_config(missing.to_str()).expect("defaults with DATABASE_URL");
    assert_eq!(defaults.server.port, 8000);
    assert_eq!(defaults.redis.host, "redis");
    assert_eq!(defaults.rate_limit.failure_policy, FailurePolicy::FailClosed);
    assert_eq!(defaults.cache.bypass_prefixes, vec!["/auth"]);
    unsafe {
        env::remove_var("DATABASE_URL");
    }

    // 5) Invalid values are rejected
    let bad_path = dir.path().join("bad.toml");
    fs::write(
        &bad_path,
        r#"
[database]
url = "postgres://localhost/vitalis"

[rate_limit]
window_secs = 0
"#,
    )
    .expect("write bad toml");
    let err = load_config(bad_path.to_str()).expect_err("zero window");
    assert!(err.contains("window_secs"), "{err}");

    fs::write(
        &bad_path,
        r#"
[database]
url = "postgres://localhost/vitalis"

[rate_limit]
key_prefix = "shared"

[cache]
key_prefix = "shared:"
"#,
    )
    .expect("write bad toml");
    let err = load_config(bad_path.to_str()).expect_err("overlapping prefixes");
    assert!(err.contains("overlap"), "{err}");
}
