fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/hostmgr/agent/v1/agent.proto",
                "proto/hostmgr/agent/v1/session.proto",
                "proto/hostmgr/agent/v1/events.proto",
                "proto/hostmgr/control/v1/config.proto",
            ],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto/hostmgr/agent/v1/agent.proto");
    println!("cargo:rerun-if-changed=proto/hostmgr/agent/v1/session.proto");
    println!("cargo:rerun-if-changed=proto/hostmgr/agent/v1/events.proto");
    println!("cargo:rerun-if-changed=proto/hostmgr/control/v1/config.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
