// Build script to regenerate Rust code from protobuf definitions
//
// The generated module is checked in at src/inference.rs so that building the
// crate does not require `protoc`. Set TRTLLM_REGENERATE_PROTOS=1 to rebuild it.
use std::io::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-env-changed=TRTLLM_REGENERATE_PROTOS");
    println!("cargo:rerun-if-changed=proto/grpc_service.proto");

    if std::env::var_os("TRTLLM_REGENERATE_PROTOS").is_none() {
        return Ok(());
    }

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir("src/")
        .compile_protos(&["proto/grpc_service.proto"], &["proto"])?;

    Ok(())
}
