use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

const TWO_CHILD_CIRCUIT: &str = r#"
params = [0.5, 0.5]
flows = [3.0, 7.0]

[[groups]]
kind = "sum"
num_node_groups = 1
group_size = 1
ch_group_size = 2
edge_parents = [0]
param_range = { start = 0, end = 2 }
param_flow_range = { start = 0, end = 2 }
"#;

fn write_circuit(dir: &Path) -> String {
    let path = dir.join("circuit.toml");
    fs::write(&path, TWO_CHILD_CIRCUIT).expect("write circuit");
    path.to_str().expect("path str").to_string()
}

#[test]
fn step_writes_normalized_parameters_as_csv() {
    let tmp = tempdir().expect("temporary directory");
    let circuit = write_circuit(tmp.path());
    let out_path = tmp.path().join("params.csv");

    let exe = env!("CARGO_BIN_EXE_emflow");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["step", &circuit, "--out", out_path.to_str().expect("path str")])
        .status()
        .expect("run emflow cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let csv = fs::read_to_string(&out_path).expect("read params.csv");
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows, vec!["index,value", "0,0.3", "1,0.7"]);
}

#[test]
fn inspect_succeeds_on_a_valid_circuit() {
    let tmp = tempdir().expect("temporary directory");
    let circuit = write_circuit(tmp.path());

    let output = Command::new(env!("CARGO_BIN_EXE_emflow"))
        .current_dir(tmp.path())
        .args(["inspect", &circuit])
        .output()
        .expect("run emflow cli");

    assert!(output.status.success(), "CLI exited with status {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("blocks            1"), "unexpected summary:\n{stdout}");
}

#[test]
fn inspect_rejects_a_block_size_that_is_not_a_power_of_two() {
    let tmp = tempdir().expect("temporary directory");
    let circuit = write_circuit(tmp.path());
    let config_path = tmp.path().join("engine.toml");
    fs::write(&config_path, "block_size = 24\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_emflow"))
        .current_dir(tmp.path())
        .args([
            "inspect",
            &circuit,
            "--config",
            config_path.to_str().expect("path str"),
        ])
        .output()
        .expect("run emflow cli");

    assert!(!output.status.success(), "CLI accepted block size 24");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("power of two"), "unexpected error output:\n{stderr}");
}

#[test]
fn step_rejects_a_step_size_above_one() {
    let tmp = tempdir().expect("temporary directory");
    let circuit = write_circuit(tmp.path());
    let out_path = tmp.path().join("params.csv");

    let status = Command::new(env!("CARGO_BIN_EXE_emflow"))
        .current_dir(tmp.path())
        .args([
            "step",
            &circuit,
            "--step-size",
            "2",
            "--out",
            out_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run emflow cli");

    assert!(!status.success(), "CLI accepted step size 2");
    assert!(!out_path.exists(), "no parameters should be written on failure");
}
