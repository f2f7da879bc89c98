use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    match coldchain::run() {
        Ok(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "command failed");
            println!(
                "{}",
                serde_json::to_string_pretty(&coldchain::error_envelope(&err))?
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
