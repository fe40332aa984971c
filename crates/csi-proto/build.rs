fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds do not depend on the host toolchain
    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);

    let includes = [std::path::PathBuf::from("proto"), protoc_bin_vendored::include_path()?];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &["proto/csi.proto"], &includes)?;

    println!("cargo:rerun-if-changed=proto/csi.proto");

    Ok(())
}
