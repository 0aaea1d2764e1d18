//! Credential vault against a scripted channel: persisted file shape,
//! recovery by later invocations, and the memory, disk, generate
//! precedence of `obtain`.

mod common;

use common::{fail, ok, ScriptedChannel};
use groundwork::vault::{credential_path, DB_ROOT_CREDENTIAL, SITE_ADMIN_CREDENTIAL};
use groundwork::{CredentialVault, SecretOrigin, VaultError};

#[test]
fn test_persist_writes_a_locked_down_file() {
    let mut vault = CredentialVault::new();
    let secret = vault.ensure(SITE_ADMIN_CREDENTIAL, Some("kn0wnAdminPassw0rd"));
    let path = credential_path("app", SITE_ADMIN_CREDENTIAL);

    let mut chan = ScriptedChannel::new();
    vault.persist(&mut chan, "app", &secret, &path).unwrap();

    let log = chan.commands();
    assert_eq!(log.len(), 1, "persist is one compound command");
    let cmd = &log[0];
    assert!(cmd.contains("umask 077"), "the file must be born 600");
    assert!(cmd.contains("mkdir -p /home/app/.credentials"));
    assert!(cmd.contains("kn0wnAdminPassw0rd"));
    assert!(cmd.contains("chmod 700 /home/app/.credentials"));
    assert!(cmd.contains("chmod 600 /home/app/.credentials/site-admin"));
    assert!(cmd.contains("chown -R app:app /home/app/.credentials"));
}

#[test]
fn test_persist_surfaces_a_failed_write() {
    let mut vault = CredentialVault::new();
    let secret = vault.ensure(DB_ROOT_CREDENTIAL, None);
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    // Both privileged variants fail, so the store error carries the exit.
    let mut chan = ScriptedChannel::new()
        .on("mkdir -p", fail(1, "read-only file system"))
        .on("mkdir -p", fail(1, "read-only file system"));
    match vault.persist(&mut chan, "app", &secret, &path) {
        Err(VaultError::Store { reason, .. }) => {
            assert!(reason.contains("read-only file system"));
        }
        other => panic!("expected a store error, got {other:?}"),
    }
}

#[test]
fn test_retrieve_reads_back_a_persisted_credential() {
    let vault = CredentialVault::new();
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    let mut chan = ScriptedChannel::new()
        .on("test -f /home/app/.credentials/mariadb-root", ok(""))
        .on(
            "cat /home/app/.credentials/mariadb-root",
            ok("mariadb-root: RecoveredValue42\n"),
        );
    let secret = vault.retrieve(&mut chan, &path).unwrap();
    assert_eq!(secret.label, DB_ROOT_CREDENTIAL);
    assert_eq!(secret.value, "RecoveredValue42");
    assert_eq!(secret.origin, SecretOrigin::Recovered);
}

#[test]
fn test_retrieve_of_a_never_written_path_is_not_found() {
    let vault = CredentialVault::new();
    let path = credential_path("app", SITE_ADMIN_CREDENTIAL);

    let mut chan = ScriptedChannel::new()
        .on("test -f", fail(1, ""))
        .on("test -f", fail(1, ""));
    match vault.retrieve(&mut chan, &path) {
        Err(VaultError::NotFound { path: missing }) => assert_eq!(missing, path),
        other => panic!("expected not-found, got {other:?}"),
    }
    assert!(!chan.saw("cat "), "an absent file must not be read");
}

#[test]
fn test_retrieve_rejects_a_malformed_file() {
    let vault = CredentialVault::new();
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    let mut chan = ScriptedChannel::new()
        .on("test -f", ok(""))
        .on("cat ", ok("no separator in this line\n"));
    assert!(matches!(
        vault.retrieve(&mut chan, &path),
        Err(VaultError::Malformed { .. })
    ));
}

#[test]
fn test_independent_invocations_converge_on_the_persisted_value() {
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    // First invocation generates and persists.
    let mut first_vault = CredentialVault::new();
    let generated = first_vault.ensure(DB_ROOT_CREDENTIAL, None);
    let mut first_chan = ScriptedChannel::new();
    first_vault
        .persist(&mut first_chan, "app", &generated, &path)
        .unwrap();

    // A later invocation with a fresh vault recovers the same value.
    let mut second_vault = CredentialVault::new();
    let mut second_chan = ScriptedChannel::new()
        .on("test -f", ok(""))
        .on("cat ", ok(&format!("mariadb-root: {}\n", generated.value)));
    let recovered = second_vault
        .obtain(&mut second_chan, DB_ROOT_CREDENTIAL, &path, None)
        .unwrap();
    assert_eq!(recovered.value, generated.value);
    assert_eq!(recovered.origin, SecretOrigin::Recovered);
}

#[test]
fn test_obtain_prefers_memory_over_the_host() {
    let mut vault = CredentialVault::new();
    let ensured = vault.ensure(DB_ROOT_CREDENTIAL, Some("memorizedValue99"));
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    let mut chan = ScriptedChannel::new();
    let obtained = vault
        .obtain(&mut chan, DB_ROOT_CREDENTIAL, &path, None)
        .unwrap();
    assert_eq!(obtained.value, ensured.value);
    assert!(chan.commands().is_empty(), "memoized hit must stay local");
}

#[test]
fn test_require_never_generates() {
    let mut vault = CredentialVault::new();
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    // Absent on the host and not memoized: the error propagates instead
    // of a fresh value being invented for a credential this run does not
    // own.
    let mut chan = ScriptedChannel::new()
        .on("test -f", fail(1, ""))
        .on("test -f", fail(1, ""));
    match vault.require(&mut chan, DB_ROOT_CREDENTIAL, &path) {
        Err(VaultError::NotFound { path: missing }) => assert_eq!(missing, path),
        other => panic!("expected not-found, got {other:?}"),
    }

    // A memoized value from earlier in the run satisfies it locally.
    let ensured = vault.ensure(DB_ROOT_CREDENTIAL, Some("memorizedValue99"));
    let mut chan = ScriptedChannel::new();
    let required = vault
        .require(&mut chan, DB_ROOT_CREDENTIAL, &path)
        .unwrap();
    assert_eq!(required.value, ensured.value);
    assert!(chan.commands().is_empty(), "memoized hit must stay local");
}

#[test]
fn test_require_recovers_and_memoizes_the_persisted_value() {
    let mut vault = CredentialVault::new();
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    let mut chan = ScriptedChannel::new()
        .on("test -f", ok(""))
        .on("cat ", ok("mariadb-root: PersistedRoot77\n"));
    let recovered = vault
        .require(&mut chan, DB_ROOT_CREDENTIAL, &path)
        .unwrap();
    assert_eq!(recovered.value, "PersistedRoot77");
    assert_eq!(recovered.origin, SecretOrigin::Recovered);

    let before = chan.commands().len();
    let again = vault
        .require(&mut chan, DB_ROOT_CREDENTIAL, &path)
        .unwrap();
    assert_eq!(again.value, recovered.value);
    assert_eq!(chan.commands().len(), before, "second hit is memoized");
}

#[test]
fn test_obtain_generates_when_nothing_is_persisted() {
    let mut vault = CredentialVault::new();
    let path = credential_path("app", DB_ROOT_CREDENTIAL);

    let mut chan = ScriptedChannel::new()
        .on("test -f", fail(1, ""))
        .on("test -f", fail(1, ""));
    let secret = vault
        .obtain(&mut chan, DB_ROOT_CREDENTIAL, &path, None)
        .unwrap();
    assert_eq!(secret.origin, SecretOrigin::Generated);
    assert!(chan.saw("test -f"), "the host is consulted first");

    // And the result is memoized for the rest of the run.
    let again = vault
        .obtain(&mut chan, DB_ROOT_CREDENTIAL, &path, None)
        .unwrap();
    assert_eq!(again.value, secret.value);
}
