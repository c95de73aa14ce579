use bugreport::{
    bugreport,
    collector::{CompileTimeInformation, EnvironmentVariables, OperatingSystem, SoftwareVersion},
    format::Markdown,
};

pub fn run() {
    bugreport!()
        .info(SoftwareVersion::default())
        .info(OperatingSystem::default())
        .info(EnvironmentVariables::list(&[
            "SHELL",
            "TERM",
            "RUST_LOG",
            "STASHBOX_DATA_DIR",
            "STASHBOX_DATA_FILE",
            "STASHBOX_PORT",
            "STASHBOX_SWEEP_INTERVAL_SECS",
        ]))
        .info(CompileTimeInformation::default())
        .print::<Markdown>();
}
