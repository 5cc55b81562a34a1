use std::process::ExitCode;

use camino::Utf8PathBuf;

fn main() -> ExitCode {
    let level = if std::env::var_os("PROTOLENS_DEBUG").is_some() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let paths: Vec<Utf8PathBuf> = std::env::args().skip(1).map(Utf8PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: protolens-dump <file.proto>...");
        return ExitCode::from(2);
    }

    let mut failed = 0usize;
    for path in &paths {
        let package = match protolens::parse_file(path) {
            Ok(package) => package,
            Err(err) => {
                tracing::error!(path = %path, error = %err, "skipping file");
                failed += 1;
                continue;
            }
        };
        tracing::info!(
            path = %path,
            messages = package.messages.len(),
            enums = package.enums.len(),
            services = package.services.len(),
            vertices = package.graph.vertex_count(),
            "parsed"
        );
        match serde_json::to_string_pretty(&package) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                tracing::error!(path = %path, error = %err, "failed to serialize package");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
