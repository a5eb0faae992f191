use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PASSPHRASE: &str = "hunter2 but longer";

/// One user: a keyring home plus a config with a cheap scrypt work factor.
struct User {
    dir: TempDir,
}

impl User {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("sealpost.toml"),
            "[unlock]\nscrypt_work_factor = 10\n",
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("sealpost").unwrap();
        cmd.arg("--home")
            .arg(self.path("home"))
            .arg("--config")
            .arg(self.path("sealpost.toml"))
            .env("SEALPOST_PASSPHRASE", PASSPHRASE)
            .env_remove("RUST_LOG");
        cmd
    }

    fn init(&self, address: &str) -> String {
        let out = self
            .cmd()
            .args(["keys", "init", address])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        String::from_utf8(out).unwrap().trim().to_string()
    }

    fn export_to(&self, path: &Path) {
        let out = self
            .cmd()
            .args(["keys", "export"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        fs::write(path, out).unwrap();
    }
}

fn sealpost() -> Command {
    Command::cargo_bin("sealpost").unwrap()
}

// ---------------------------------------------------------------------------
// help
// ---------------------------------------------------------------------------

#[test]
fn help_lists_commands() {
    sealpost()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("keys"))
        .stdout(predicate::str::contains("compose"))
        .stdout(predicate::str::contains("draft"))
        .stdout(predicate::str::contains("decrypt"));
}

#[test]
fn compose_help_shows_flags() {
    sealpost()
        .args(["compose", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--to"))
        .stdout(predicate::str::contains("--sign-only"))
        .stdout(predicate::str::contains("--attach"));
}

#[test]
fn completions_need_no_keyring() {
    sealpost()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sealpost"));
}

// ---------------------------------------------------------------------------
// keys
// ---------------------------------------------------------------------------

#[test]
fn init_creates_default_key() {
    let alice = User::new();
    let fp = alice.init("alice@example.com");
    assert_eq!(fp.len(), 40);

    alice
        .cmd()
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&fp))
        .stdout(predicate::str::contains("private"))
        .stdout(predicate::str::contains("alice@example.com"));
}

#[test]
fn init_rejects_non_address() {
    User::new()
        .cmd()
        .args(["keys", "init", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not an address"));
}

#[test]
fn export_has_no_secret_half() {
    let alice = User::new();
    alice.init("alice@example.com");
    let path = alice.path("alice.asc");
    alice.export_to(&path);

    let armored = fs::read_to_string(&path).unwrap();
    assert!(armored.contains("BEGIN SEALPOST PUBLIC KEY"));

    // our own public copy is already known: nothing to ask
    alice
        .cmd()
        .args(["keys", "import"])
        .arg(&path)
        .assert()
        .success()
        .stderr(predicate::str::contains("updated key"));
}

#[test]
fn import_without_confirmation_is_not_applied() {
    let alice = User::new();
    let bob = User::new();
    alice.init("alice@example.com");
    bob.init("bob@example.com");
    let bob_key = alice.path("bob.asc");
    bob.export_to(&bob_key);

    alice
        .cmd()
        .args(["keys", "import"])
        .arg(&bob_key)
        .assert()
        .success()
        .stderr(predicate::str::contains("not imported"));

    alice
        .cmd()
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bob@example.com").not());
}

#[test]
fn import_refuses_private_keys() {
    let alice = User::new();
    alice.init("alice@example.com");
    let secret = fs::read_dir(alice.path("home/keyrings/main/keys"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "asc"))
        .unwrap();

    User::new()
        .cmd()
        .args(["--yes", "keys", "import"])
        .arg(&secret)
        .assert()
        .failure()
        .stderr(predicate::str::contains("refusing to import a private key"));
}

// ---------------------------------------------------------------------------
// compose and decrypt
// ---------------------------------------------------------------------------

fn exchange() -> (User, User) {
    let alice = User::new();
    let bob = User::new();
    alice.init("alice@example.com");
    bob.init("bob@example.com");
    let bob_key = alice.path("bob.asc");
    bob.export_to(&bob_key);
    alice
        .cmd()
        .args(["--yes", "keys", "import"])
        .arg(&bob_key)
        .assert()
        .success()
        .stderr(predicate::str::contains("imported key"));
    (alice, bob)
}

#[test]
fn compose_then_decrypt() {
    let (alice, bob) = exchange();
    let body = alice.path("body.txt");
    fs::write(&body, "meet at noon\n").unwrap();
    let notes = alice.path("notes.txt");
    fs::write(&notes, "bring snacks").unwrap();
    let message = alice.path("message.asc");

    alice
        .cmd()
        .args(["compose", "--to", "bob@example.com", "--subject", "lunch"])
        .arg("--body-file")
        .arg(&body)
        .arg("--attach")
        .arg(&notes)
        .arg("--output")
        .arg(&message)
        .assert()
        .success()
        .stderr(predicate::str::contains("message ready"));

    assert!(alice.path("notes.txt.sealpost").exists());
    assert!(fs::read_to_string(&message)
        .unwrap()
        .contains("BEGIN SEALPOST MESSAGE"));

    bob.cmd()
        .arg("decrypt")
        .arg(&message)
        .assert()
        .success()
        .stdout(predicate::str::contains("meet at noon"))
        .stderr(predicate::str::contains("lunch"));

    // attachments decrypt on their own
    bob.cmd()
        .arg("decrypt")
        .arg(alice.path("notes.txt.sealpost"))
        .assert()
        .success()
        .stdout(predicate::str::contains("bring snacks"));
}

#[test]
fn compose_to_unknown_recipient_fails() {
    let alice = User::new();
    alice.init("alice@example.com");

    alice
        .cmd()
        .args(["compose", "--to", "b@x.com"])
        .write_stdin("hello")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no key found for recipient(s): b@x.com"));
}

#[test]
fn wrong_passphrase_fails_compose() {
    let (alice, _bob) = exchange();
    alice
        .cmd()
        .env("SEALPOST_PASSPHRASE", "not it")
        .args(["compose", "--to", "bob@example.com"])
        .write_stdin("hello")
        .assert()
        .failure()
        .stderr(predicate::str::contains("wrong passphrase"));
}

#[test]
fn unanswered_passphrase_cancels_quietly() {
    let (alice, _bob) = exchange();
    let message = alice.path("message.asc");

    // no passphrase in the environment and no terminal to ask on
    alice
        .cmd()
        .env_remove("SEALPOST_PASSPHRASE")
        .args(["compose", "--to", "bob@example.com", "--output"])
        .arg(&message)
        .write_stdin("hello")
        .assert()
        .success()
        .stderr(predicate::str::contains("Error").not())
        .stderr(predicate::str::contains("message ready").not());
    assert!(!message.exists());
}

#[test]
fn unanswered_passphrase_cancels_decrypt_quietly() {
    let (alice, bob) = exchange();
    let message = alice.path("message.asc");
    alice
        .cmd()
        .args(["compose", "--to", "bob@example.com", "--output"])
        .arg(&message)
        .write_stdin("for bob")
        .assert()
        .success();

    let plain = bob.path("plain.txt");
    bob.cmd()
        .env_remove("SEALPOST_PASSPHRASE")
        .arg("decrypt")
        .arg(&message)
        .arg("--output")
        .arg(&plain)
        .assert()
        .success()
        .stderr(predicate::str::contains("Error").not());
    assert!(!plain.exists());
}

#[cfg(unix)]
#[test]
fn decrypted_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let (alice, bob) = exchange();
    let message = alice.path("message.asc");
    alice
        .cmd()
        .args(["compose", "--to", "bob@example.com", "--output"])
        .arg(&message)
        .write_stdin("for bob")
        .assert()
        .success();

    let plain = bob.path("plain.txt");
    bob.cmd()
        .arg("decrypt")
        .arg(&message)
        .arg("--output")
        .arg(&plain)
        .assert()
        .success();
    assert!(fs::read_to_string(&plain).unwrap().contains("for bob"));
    let mode = fs::metadata(&plain).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn decrypt_needs_our_key() {
    let (alice, _bob) = exchange();
    let carol = User::new();
    carol.init("carol@example.com");

    let message = alice.path("message.asc");
    alice
        .cmd()
        .args(["compose", "--to", "bob@example.com", "--output"])
        .arg(&message)
        .write_stdin("not for carol")
        .assert()
        .success();

    carol
        .cmd()
        .arg("decrypt")
        .arg(&message)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not addressed to any key"));
}

#[test]
fn sign_only_output_is_readable() {
    let alice = User::new();
    alice.init("alice@example.com");
    alice
        .cmd()
        .args(["compose", "--sign-only"])
        .write_stdin("public announcement")
        .assert()
        .success()
        .stdout(predicate::str::contains("BEGIN SEALPOST SIGNED MESSAGE"));
}

// ---------------------------------------------------------------------------
// drafts
// ---------------------------------------------------------------------------

#[test]
fn draft_save_and_open() {
    let alice = User::new();
    alice.init("alice@example.com");
    let draft = alice.path("draft.asc");
    let sketch = alice.path("sketch.txt");
    fs::write(&sketch, "v1").unwrap();

    alice
        .cmd()
        .args(["draft", "save", "--subject", "plans"])
        .arg("--attach")
        .arg(&sketch)
        .arg("--output")
        .arg(&draft)
        .write_stdin("half a thought")
        .assert()
        .success();

    let out_dir = alice.path("restored");
    fs::create_dir(&out_dir).unwrap();
    alice
        .cmd()
        .args(["draft", "open"])
        .arg(&draft)
        .arg("--attachments-dir")
        .arg(&out_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Subject: plans"))
        .stdout(predicate::str::contains("half a thought"));
    assert_eq!(fs::read_to_string(out_dir.join("sketch.txt")).unwrap(), "v1");
}

#[test]
fn someone_elses_draft_is_refused() {
    let (alice, bob) = exchange();
    // a message signed by someone else is not a draft
    let alice_key = bob.path("alice.asc");
    alice.export_to(&alice_key);
    bob.cmd()
        .args(["--yes", "keys", "import"])
        .arg(&alice_key)
        .assert()
        .success();

    let message = bob.path("to-alice.asc");
    bob.cmd()
        .args(["compose", "--to", "alice@example.com", "--output"])
        .arg(&message)
        .write_stdin("not a draft")
        .assert()
        .success();

    alice
        .cmd()
        .args(["draft", "open"])
        .arg(&message)
        .assert()
        .failure()
        .stderr(predicate::str::contains("draft is corrupted"));
}
