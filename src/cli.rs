use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Popular-topic digest worker.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file; environment variables override its values
    #[arg(long, global = true, env = "DIGEST_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the collector, the builder and the HTTP control plane until signalled
    Serve,
    /// Fetch, rank and render today's digest once, then exit
    Generate {
        /// Write the digest here instead of the configured output directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    /// サブコマンド省略時は `serve`。
    #[must_use]
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve() {
        let cli = Cli::try_parse_from(["digest-worker"]).expect("parses");
        assert_eq!(cli.command(), Command::Serve);
    }

    #[test]
    fn parses_generate_with_output() {
        let cli = Cli::try_parse_from([
            "digest-worker",
            "--config",
            "digest.yaml",
            "generate",
            "--output",
            "today.md",
        ])
        .expect("parses");

        assert_eq!(cli.config, Some(PathBuf::from("digest.yaml")));
        assert_eq!(
            cli.command(),
            Command::Generate {
                output: Some(PathBuf::from("today.md"))
            }
        );
    }
}
