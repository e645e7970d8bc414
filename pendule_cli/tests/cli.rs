use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;

fn sim_config_text() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../etc/pendule-sim.toml");
    fs::read_to_string(path).expect("read etc/pendule-sim.toml")
}

// Sim config with its own ports so tests can run in parallel.
fn write_sim_config(dir: &tempfile::TempDir, state_port: u16) -> PathBuf {
    let text = sim_config_text()
        .replace("state_port = 10001", &format!("state_port = {state_port}"))
        .replace(
            "command_port = 10002",
            &format!("command_port = {}", state_port + 1),
        );
    let path = dir.path().join("pendule.toml");
    fs::write(&path, text).unwrap();
    path
}

fn pendule() -> Command {
    let mut cmd = Command::cargo_bin("pendule").unwrap();
    cmd.env("PENDULE_SIM_FAST", "1").env_remove("RUST_LOG");
    cmd
}

fn json_line(stdout: &[u8], key: &str) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(stdout);
    let line = stdout
        .lines()
        .find(|l| l.contains(&format!("\"{key}\"")))
        .unwrap_or_else(|| panic!("no JSON line with {key}; stdout was: {stdout}"));
    serde_json::from_str(line).expect("valid JSON")
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["template"], 0, "[left_switch]", "stdout")]
#[case(&["monitor", "--count", "many"], 2, "invalid value", "stderr")]
#[case(&["serve", "--rt-lock", "sometimes"], 2, "invalid value", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let assert = pendule().args(args).assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
fn template_output_is_a_valid_config() {
    let out = pendule().arg("template").assert().success().get_output().stdout.clone();
    let cfg = pendule_config::load_toml(&String::from_utf8_lossy(&out)).expect("parse template");
    cfg.validate().expect("template validates");
}

#[rstest]
fn missing_config_file_is_explained() {
    pendule()
        .args(["--config", "/nonexistent/pendule.toml", "calibrate"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to read config"))
        .stderr(predicate::str::contains("How to fix"));
}

#[rstest]
fn invalid_config_is_rejected_before_touching_gpio() {
    let dir = tempdir().unwrap();
    let text = sim_config_text().replace("pin_b = 26", "pin_b = 17");
    let cfg = dir.path().join("bad.toml");
    fs::write(&cfg, text).unwrap();

    pendule()
        .arg("--config")
        .arg(&cfg)
        .arg("calibrate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("reuses pin 17"));
}

#[rstest]
fn calibrate_on_the_simulated_rig() {
    let dir = tempdir().unwrap();
    let cfg = write_sim_config(&dir, 47_301);

    pendule()
        .arg("--config")
        .arg(&cfg)
        .arg("calibrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Calibrated: min="))
        .stdout(predicate::str::contains("margin=50 steps"));
}

#[rstest]
fn calibrate_json_schema() {
    let dir = tempdir().unwrap();
    let cfg = write_sim_config(&dir, 47_311);

    let out = pendule()
        .args(["--json", "--log-level", "error", "--config"])
        .arg(&cfg)
        .arg("calibrate")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v = json_line(&out, "min_steps");
    let min = v["min_steps"].as_i64().unwrap();
    let max = v["max_steps"].as_i64().unwrap();
    assert!(min < 0 && max > 0, "range {min}..{max}");
    assert_eq!(v["margin_steps"].as_i64(), Some(50));
    assert!(v["soft_limit_m"].as_f64().unwrap() > 0.0);
    assert!(v.get("timestamp").and_then(|x| x.as_u64()).is_some());
}

#[rstest]
fn serve_stops_after_max_periods() {
    let dir = tempdir().unwrap();
    let cfg = write_sim_config(&dir, 47_321);

    let out = pendule()
        .args(["--json", "--log-level", "error", "--config"])
        .arg(&cfg)
        .args(["serve", "--max-periods", "25", "--stats"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Pendule Stats"))
        .get_output()
        .stdout
        .clone();
    let v = json_line(&out, "iterations");
    assert_eq!(v["iterations"].as_u64(), Some(25));
    assert_eq!(v["watchdog_trips"].as_u64(), Some(0));
    assert_eq!(v["missed_messages"].as_u64(), Some(25));
}

#[rstest]
fn monitor_without_server_reports_json_error() {
    let dir = tempdir().unwrap();
    let cfg = write_sim_config(&dir, 47_331);

    let out = pendule()
        .args(["--json", "--log-level", "error", "--config"])
        .arg(&cfg)
        .args(["monitor", "--wait-ms", "100"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let v = json_line(&out, "reason");
    assert_eq!(v["reason"], "ServerUnavailable");
    assert!(v["message"].as_str().unwrap().contains("What happened"));
}

#[rstest]
fn reset_gpio_floats_every_user_pin() {
    pendule()
        .arg("reset-gpio")
        .assert()
        .success()
        .stdout(predicate::str::contains("Released 27 pins (0 failures)."));
}
