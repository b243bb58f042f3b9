fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    // All schemas end up in OUT_DIR and are pulled in with include_proto!.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/raft_service.proto",
                "proto/raft_persistence.proto",
                "proto/keyvalue.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
