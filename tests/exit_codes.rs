use std::process::Command;

#[test]
fn throwmap_exits_non_zero_on_error() {
    let throwmap = std::env::var("CARGO_BIN_EXE_throwmap")
        .or_else(|_| std::env::var("CARGO_BIN_EXE_throwmap"))
        .unwrap_or_else(|_| {
            let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
            path.push("target");
            path.push("debug");
            path.push("throwmap");
            if cfg!(windows) {
                path.set_extension("exe");
            }
            path.to_string_lossy().to_string()
        });
    let output = Command::new(throwmap)
        .arg("--compile-db")
        .arg("missing.json")
        .arg("--extractor")
        .arg("missing-extractor")
        .arg("--output-dir")
        .arg(std::env::temp_dir().join("throwmap-exit-code-test"))
        .output()
        .expect("run throwmap");

    assert!(!output.status.success());
}
