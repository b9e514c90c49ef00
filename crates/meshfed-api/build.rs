fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Note: Proto compilation is disabled for now.
    // The discovery messages are implemented as native Rust types with
    // hand-written prost impls. Proto files are kept for reference.
    //
    // To enable proto compilation, uncomment the following:
    // tonic_prost_build::configure()
    //     .build_server(true)
    //     .build_client(true)
    //     .out_dir("src/")
    //     .compile_protos(&["proto/federation.proto"], &["proto/"])?;

    // Tell Cargo to rerun if proto files change
    println!("cargo:rerun-if-changed=proto/");

    Ok(())
}
