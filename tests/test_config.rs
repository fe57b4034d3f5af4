use std::io::Write;
use std::sync::Mutex;

use ferrule::config::{AccessKind, Config, DEFAULT_MODULES, RewriteTarget};
use ferrule::error::ConfigError;

// Tests touching process environment must not interleave.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_config_default_address() {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::remove_var("LISTEN");
        std::env::remove_var("FERRULE_CONFIG");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
}

#[test]
fn test_config_custom_address_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::remove_var("FERRULE_CONFIG");
        std::env::set_var("LISTEN", "0.0.0.0:3000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");
    unsafe {
        std::env::remove_var("LISTEN");
    }
}

#[test]
fn test_config_file_from_env_with_listen_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "server:\n  listen_addr: 127.0.0.1:9000\n  workers: 2").unwrap();

    unsafe {
        std::env::set_var("FERRULE_CONFIG", file.path());
        std::env::remove_var("LISTEN");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:9000");
    assert_eq!(cfg.server.workers, 2);

    unsafe {
        std::env::set_var("LISTEN", "0.0.0.0:5000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:5000");

    unsafe {
        std::env::remove_var("FERRULE_CONFIG");
        std::env::remove_var("LISTEN");
    }
}

#[test]
fn test_config_missing_file_is_an_error() {
    let result = Config::from_file("/nonexistent/ferrule.yaml");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_config_defaults() {
    let cfg = Config::default();

    assert_eq!(cfg.modules, DEFAULT_MODULES);
    assert_eq!(cfg.server.keep_alive_max, 100);
    assert_eq!(cfg.server.index_files, vec!["index.html", "index.htm"]);
    assert!(!cfg.server.directory_listing);
    assert_eq!(cfg.server.scheme(), "http");
    assert!(cfg.server.signature.starts_with("ferrule/"));
}

#[test]
fn test_config_partial_yaml_keeps_defaults() {
    let cfg = Config::from_yaml_str("server:\n  server_name: example.com\n").unwrap();

    assert_eq!(cfg.server.server_name, "example.com");
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.modules.len(), DEFAULT_MODULES.len());
}

#[test]
fn test_config_rewrites_with_literal_and_map_targets() {
    let cfg = Config::from_yaml_str(
        r#"
rewrites:
  - condition: "^/old/(.*)$"
    target: "/new/$1"
    flag: "R=301,L"
  - condition: "^/lang/(.*)$"
    target:
      en: /english
      fr: /francais
    flag: M
"#,
    )
    .unwrap();

    assert_eq!(cfg.rewrites.len(), 2);
    assert_eq!(
        cfg.rewrites[0].target,
        RewriteTarget::Literal("/new/$1".to_string())
    );
    assert_eq!(cfg.rewrites[0].flag, "R=301,L");
    match &cfg.rewrites[1].target {
        RewriteTarget::Map(map) => assert_eq!(map.get("fr").map(String::as_str), Some("/francais")),
        other => panic!("expected map target, got {other:?}"),
    }
}

#[test]
fn test_config_access_and_virtual_hosts() {
    let cfg = Config::from_yaml_str(
        r#"
access:
  - type: deny
    params:
      REMOTE_ADDR: "^10\\."
virtual_hosts:
  - name: example.com
    aliases: [www.example.com]
    document_root: /srv/example
    access:
      - type: allow
"#,
    )
    .unwrap();

    assert_eq!(cfg.access[0].kind, AccessKind::Deny);
    assert_eq!(cfg.access[0].params.get("REMOTE_ADDR").unwrap(), "^10\\.");

    let vhost = cfg.virtual_host("example.com").unwrap();
    assert!(vhost.matches("WWW.EXAMPLE.COM"));
    assert!(!vhost.matches("other.com"));
    assert_eq!(vhost.access[0].kind, AccessKind::Allow);
    assert!(cfg.virtual_host("www.example.com").is_none());
}

#[test]
fn test_config_invalid_yaml() {
    let result = Config::from_yaml_str("access:\n  - type: maybe\n");
    assert!(matches!(result, Err(ConfigError::Yaml(_))));
}
