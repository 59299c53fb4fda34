// Integration tests for the `opgen` binary: emit targets, output files and
// exit codes.

use std::path::{Path, PathBuf};
use std::ffi::OsStr;
use std::process::{Command, Output};

fn opgen_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_opgen"))
}

const RES_CALC: &str = r#"{
  "name": "res_calc",
  "set": "edges",
  "args": [
    { "dataset": "x",   "kind": "INDIRECT", "map": "pedge",  "column": 0, "access": "READ", "type": "real(8)", "dim": 2 },
    { "dataset": "x",   "kind": "INDIRECT", "map": "pedge",  "column": 1, "access": "READ", "type": "real(8)", "dim": 2 },
    { "dataset": "res", "kind": "INDIRECT", "map": "pecell", "column": 0, "access": "INC",  "type": "real(8)", "dim": 4 },
    { "dataset": "res", "kind": "INDIRECT", "map": "pecell", "column": 1, "access": "INC",  "type": "real(8)", "dim": 4 }
  ]
}"#;

const RES_CALC_BODY: &str = "subroutine res_calc(x1, x2, res1, res2)
  real(8), dimension(2) :: x1
  real(8), dimension(2) :: x2
  real(8), dimension(4) :: res1
  real(8), dimension(4) :: res2
  res1(1) = res1(1) + x1(1) - x2(1)
  res2(1) = res2(1) - x1(1) + x2(1)
end subroutine
";

/// Fresh scratch directory per test.
fn scratch(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("opgen-cli-{}-{}", test, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn os(s: &str) -> &OsStr {
    OsStr::new(s)
}

fn run(args: &[&OsStr]) -> Output {
    Command::new(opgen_binary())
        .args(args)
        .output()
        .expect("failed to run opgen")
}

#[test]
fn module_written_to_out_dir() {
    let dir = scratch("module");
    let json = write(&dir, "res_calc.json", RES_CALC);
    write(&dir, "res_calc.inc", RES_CALC_BODY);
    let out = dir.join("out");

    let output = run(&[json.as_os_str(), os("-o"), out.as_os_str()]);
    assert!(
        output.status.success(),
        "opgen should succeed.\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let text = std::fs::read_to_string(out.join("res_calc_kernel.CUF")).unwrap();
    assert!(text.contains("MODULE RES_CALC_MODULE"));
    assert!(text.contains("attributes (global) SUBROUTINE op_cuda_res_calc("));
}

#[test]
fn layout_does_not_need_body() {
    let dir = scratch("layout");
    let json = write(&dir, "res_calc.json", RES_CALC);

    let output = run(&[json.as_os_str(), os("--emit"), os("layout")]);
    assert!(
        output.status.success(),
        "--emit layout should succeed without a body.\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"kind\": \"indirect\""));
    assert!(stdout.contains("\"colored\": true"));
}

#[test]
fn body_dir_is_honoured() {
    let dir = scratch("body-dir");
    let json = write(&dir, "res_calc.json", RES_CALC);
    let bodies = dir.join("bodies");
    std::fs::create_dir_all(&bodies).unwrap();
    write(&bodies, "res_calc.inc", RES_CALC_BODY);

    let output = run(&[
        json.as_os_str(),
        os("--body-dir"),
        bodies.as_os_str(),
        os("--emit"),
        os("body"),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("attributes(device) subroutine res_calc_gpu("));
}

#[test]
fn build_info_reports_fingerprints() {
    let dir = scratch("build-info");
    let json = write(&dir, "res_calc.json", RES_CALC);
    write(&dir, "res_calc.inc", RES_CALC_BODY);

    let output = run(&[json.as_os_str(), os("--emit"), os("build-info")]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let info: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(info["loop"], "res_calc");
    assert_eq!(info["descriptor_fingerprint"].as_str().unwrap().len(), 64);
    assert_eq!(info["compiler_version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn missing_body_exits_1() {
    let dir = scratch("no-body");
    let json = write(&dir, "res_calc.json", RES_CALC);

    let output = run(&[json.as_os_str()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("E0012"));
}

#[test]
fn repeated_loop_exits_1() {
    let dir = scratch("repeat");
    let json = write(&dir, "res_calc.json", RES_CALC);
    write(&dir, "res_calc.inc", RES_CALC_BODY);

    let output = run(&[json.as_os_str(), json.as_os_str(), os("--emit"), os("kernel")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("E0009"));
}

#[test]
fn malformed_dimension_exits_1_with_e0004() {
    let dir = scratch("bad-dim");
    let json = write(&dir, "res_calc.json", &RES_CALC.replacen("\"dim\": 2 }", "\"dim\": \"2-3\" }", 1));

    let output = run(&[json.as_os_str(), os("--emit"), os("layout")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0004"), "{}", stderr);
    assert!(stderr.contains("res_calc.json"), "{}", stderr);
}

#[test]
fn unreadable_descriptor_exits_2() {
    let dir = scratch("missing");
    let output = run(&[dir.join("nope.json").as_os_str()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn bad_config_exits_2() {
    let dir = scratch("config");
    let json = write(&dir, "res_calc.json", RES_CALC);
    let config = write(&dir, "opgen.json", "{ \"no_such_option\": 1 }");

    let output = run(&[json.as_os_str(), os("--config"), config.as_os_str()]);
    assert_eq!(output.status.code(), Some(2));
}
