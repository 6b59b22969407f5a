use std::path::PathBuf;

use protox::prost::Message;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // `protoc` is not available in this build environment, so use the pure-Rust
    // `protox` compiler to produce the FileDescriptorSet and feed it to
    // tonic-build via `file_descriptor_set_path` + `skip_protoc_run`. The
    // generated code is identical to a `protoc`-driven build.
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let fds_path = out_dir.join("sandboxapi.fds.bin");

    let fds = protox::compile(["proto/sandboxapi.proto"], ["proto"])?;
    std::fs::write(&fds_path, fds.encode_to_vec())?;

    tonic_build::configure()
        .file_descriptor_set_path(&fds_path)
        .skip_protoc_run()
        .compile_protos(&["proto/sandboxapi.proto"], &["proto"])?;

    Ok(())
}
