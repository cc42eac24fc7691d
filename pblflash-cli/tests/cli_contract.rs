//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("pcl")
}

/// Command isolated from the caller's environment and config files.
fn isolated_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env("XDG_CONFIG_HOME", dir)
        .env("HOME", dir)
        .env_remove("PCL_PORT")
        .env_remove("PCL_BAUD")
        .env_remove("PCL_ADDRESS")
        .env_remove("PCL_PRODUCT_ID")
        .env_remove("PCL_CONFIG")
        .env_remove("PCL_RELAY_HOST")
        .env_remove("PCL_RELAY_SERVICE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pcl"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pcl"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_flash_options() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--eeprom")
                .and(predicate::str::contains("--execute"))
                .and(predicate::str::contains("--check")),
        );
}

#[test]
fn completions_bash_exits_zero() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("pcl"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_address_out_of_range() {
    let mut cmd = cli_cmd();
    cmd.args(["-a", "32", "query"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("out of range"));
}

#[test]
fn exit_code_two_for_eeprom_with_execute() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "--eeprom", "--execute", "ee.bin"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_without_port() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .arg("query")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("port"));
}

#[test]
fn exit_code_two_without_image_file() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no image file"));
}

#[test]
fn exit_code_one_for_missing_explicit_config() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir
        .path()
        .join("missing.toml");
    isolated_cmd(dir.path())
        .arg("--config")
        .arg(&missing)
        .arg("query")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("config"));
}

#[test]
fn exit_code_one_for_unopenable_port() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir
        .path()
        .join("app.hex");
    fs::write(&image, ":0408000001020304EA\n:00000001FF\n").expect("write image");

    isolated_cmd(dir.path())
        .args(["-p", "/nonexistent/pcl-test-tty", "flash"])
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_is_warned_and_ignored() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("pcl.toml"), "invalid toml [[[").expect("write invalid config");

    // Falls through to the missing-port usage error.
    isolated_cmd(dir.path())
        .arg("query")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn local_config_supplies_port() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("pcl.toml"),
        "[connection]\nport = \"/nonexistent/pcl-config-tty\"\n",
    )
    .expect("write config");

    isolated_cmd(dir.path())
        .arg("query")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("pcl-config-tty"));
}

#[test]
fn local_config_address_is_validated() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("pcl.toml"), "[device]\naddress = 40\n").expect("write config");

    isolated_cmd(dir.path())
        .arg("run")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("out of range"));
}

// ============================================================================
// stdout/stderr Separation Tests
// ============================================================================

#[test]
fn query_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["-p", "/nonexistent/pcl-test-tty", "query", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn unknown_flag_suggests_similar() {
    let mut cmd = cli_cmd();
    cmd.args(["query", "--jason"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("json").or(predicate::str::contains("did you mean")));
}
