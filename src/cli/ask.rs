use anyhow::Result;
use clap::Args;
use std::io::{self, Write};
use std::time::Duration;

use super::RuntimeArgs;
use crate::core::{ChatClient, NoRuntimeError};

#[derive(Args)]
pub struct AskArgs {
    /// The question to ask
    pub question: String,

    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// Stream tokens as they arrive
    #[arg(long)]
    pub stream: bool,

    /// System preamble
    #[arg(long)]
    pub system: Option<String>,

    /// Skip session logging for this question
    #[arg(long)]
    pub no_log: bool,
}

pub async fn run(args: AskArgs) -> Result<()> {
    let options = args.runtime.client_options(args.stream, !args.no_log);
    let candidates = args.runtime.candidates(&options);

    let mut client =
        match ChatClient::connect_first_reachable(&candidates, &options, Duration::from_secs(1)) {
            Ok(client) => client,
            Err(error) => {
                if error.downcast_ref::<NoRuntimeError>().is_some() {
                    eprintln!("{error}");
                    std::process::exit(2);
                }
                return Err(error);
            }
        };

    if let Some(ref system) = args.system {
        client.reset_messages(Some(system));
    }

    let reply = if args.stream {
        let mut sink = |piece: &str| {
            print!("{piece}");
            let _ = io::stdout().flush();
        };
        let reply = client.one_turn(&args.question, Some(&mut sink)).await?;
        println!();
        reply
    } else {
        let reply = client.one_turn(&args.question, None).await?;
        if let Some(ref text) = reply {
            println!("{text}");
        }
        reply
    };

    if reply.is_some() {
        client.ensure_auto_title()?;
        client.append_session_to_day_log()?;
    } else {
        client.maybe_delete_empty_session()?;
    }
    Ok(())
}
