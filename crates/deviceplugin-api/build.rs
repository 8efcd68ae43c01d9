fn main() -> Result<(), Box<dyn std::error::Error>> {
    // the plugin serves DevicePlugin and dials Registration, tests do the reverse
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
