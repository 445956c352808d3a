//! Command-line parsing. Flags override the matching config file values.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve(ServeArgs),
    /// Print a bcrypt hash of the password and exit.
    HashPassword(String),
    Version,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeArgs {
    pub config: PathBuf,
    pub port: Option<u16>,
    pub tls: bool,
}

pub const DEFAULT_CONFIG: &str = "config.yml";

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--config PATH|-c PATH] [--port PORT|-p PORT] [--tls]\n       \
         {prog} --hash-password PASSWORD\n       \
         {prog} --version | --help"
    )
}

fn flag_value(
    arg: &str,
    long: &str,
    it: &mut impl Iterator<Item = String>,
) -> Result<String, String> {
    let inline = arg
        .strip_prefix(long)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::to_string);
    inline
        .or_else(|| it.next())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{long} needs a value"))
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "talaria_agent".into());
    let mut config: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut tls = false;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "--tls" => tls = true,
            "-c" => config = Some(flag_value(&arg, "-c", &mut it)?),
            "-p" => port = Some(parse_port(&flag_value(&arg, "-p", &mut it)?)?),
            _ if arg == "--config" || arg.starts_with("--config=") => {
                config = Some(flag_value(&arg, "--config", &mut it)?);
            }
            _ if arg == "--port" || arg.starts_with("--port=") => {
                port = Some(parse_port(&flag_value(&arg, "--port", &mut it)?)?);
            }
            _ if arg == "--hash-password" || arg.starts_with("--hash-password=") => {
                let pw = flag_value(&arg, "--hash-password", &mut it)?;
                return Ok(Command::HashPassword(pw));
            }
            _ => return Err(format!("Unexpected argument '{arg}'.\n{}", usage(&prog))),
        }
    }
    Ok(Command::Serve(ServeArgs {
        config: PathBuf::from(config.unwrap_or_else(|| DEFAULT_CONFIG.to_string())),
        port,
        tls,
    }))
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port '{s}'"))
}
