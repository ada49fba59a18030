fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/pod_resources.proto");
    // only the PodResourcesLister client is needed
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/pod_resources.proto"], &["proto"])?;
    Ok(())
}
