use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "swc",
    version,
    about = "Inspect and manage Swift containers",
    long_about = "`swc` runs single object-storage operations against a named remote.

EXAMPLE:
    # Share an object for one hour
    swc --remote backup temp-key photos 'some secret'
    swc --remote backup temp-url photos 2024/cat.jpg --ttl 1h"
)]
struct Args {
    /// Remote to operate on, `@env` reads OS_* variables from the environment
    #[arg(short = 'r', long, default_value = swift::ENV_REMOTE, value_name = "NAME")]
    remote: String,

    /// Remotes file, defaults to <config dir>/swiftcas/remotes.toml
    #[arg(long, value_name = "PATH")]
    remotes: Option<std::path::PathBuf>,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List the objects of a container
    List {
        container: String,
        /// Only list names starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Also print size, hash and content type
        #[arg(short, long)]
        long: bool,
    },
    /// Print the headers of the account, a container or an object
    Head {
        container: Option<String>,
        name: Option<String>,
    },
    /// Create a container
    Mkcontainer {
        container: String,
        /// Make the container world readable
        #[arg(long)]
        public: bool,
    },
    /// Set the temporary URL key of a container
    TempKey { container: String, key: String },
    /// Print a signed temporary URL for an object
    TempUrl {
        container: String,
        name: String,
        /// HTTP method the URL grants
        #[arg(long, default_value = "GET")]
        method: String,
        /// Validity, e.g. "1h", "7days"
        #[arg(long, default_value = "1day", value_parser = humantime::parse_duration)]
        ttl: std::time::Duration,
    },
    /// Upload a local file
    Upload {
        container: String,
        file: std::path::PathBuf,
        /// Object name, defaults to the file name
        name: Option<String>,
        /// Content type of the object
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download an object to a local file
    Download {
        container: String,
        name: String,
        file: std::path::PathBuf,
    },
    /// Delete an object
    Delete { container: String, name: String },
}

fn format_headers(headers: &swift::HeaderMap) -> String {
    let mut lines: Vec<String> = headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect();
    lines.sort();
    lines.join("\n")
}

#[instrument(skip(ctx))]
async fn execute(ctx: &swift::Context, command: Command) -> Result<String> {
    match command {
        Command::List {
            container,
            prefix,
            long,
        } => {
            let mut output = String::new();
            let mut entries =
                swift::storage::list_container(ctx, &container, prefix.as_deref()).into_stream();
            while let Some(entry) = entries.try_next().await? {
                if long {
                    writeln!(
                        output,
                        "{:>10} {} {} {}",
                        bytesize::ByteSize(entry.bytes).to_string(),
                        entry.hash,
                        entry.content_type,
                        entry.name
                    )?;
                } else {
                    writeln!(output, "{}", entry.name)?;
                }
            }
            Ok(output.trim_end().to_string())
        }
        Command::Head { container, name } => {
            let headers = match (container, name) {
                (None, _) => swift::storage::show_account(ctx).await?,
                (Some(container), None) => swift::storage::show_container(ctx, &container).await?,
                (Some(container), Some(name)) => {
                    swift::storage::head(ctx, &container, &name).await?
                }
            };
            Ok(format_headers(&headers))
        }
        Command::Mkcontainer { container, public } => {
            swift::storage::create_container(ctx, &container, swift::HeaderMap::new()).await?;
            if public {
                swift::storage::set_container_read(ctx, &container, ".r:*").await?;
            }
            Ok(format!("created {}", container))
        }
        Command::TempKey { container, key } => {
            swift::storage::temp_key(ctx, &container, &key).await?;
            Ok(format!("temp url key of {} updated", container))
        }
        Command::TempUrl {
            container,
            name,
            method,
            ttl,
        } => {
            let method: swift::Method = method
                .to_uppercase()
                .parse()
                .map_err(|_| anyhow!("invalid method {:?}", method))?;
            let url = swift::storage::temp_url(ctx, &container, &name, method, ttl).await?;
            Ok(url.to_string())
        }
        Command::Upload {
            container,
            file,
            name,
            content_type,
        } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive an object name from {:?}", file))?,
            };
            let headers = match &content_type {
                Some(content_type) => swift::headers(&[("content-type", content_type.as_str())])?,
                None => swift::HeaderMap::new(),
            };
            let stored = swift::storage::put_file(ctx, &container, &name, &file, headers)
                .await
                .with_context(|| format!("failed uploading {:?}", file))?;
            let etag = stored
                .get("etag")
                .and_then(|etag| etag.to_str().ok())
                .unwrap_or_default();
            Ok(format!("uploaded {}/{} {}", container, name, etag).trim_end().to_string())
        }
        Command::Download {
            container,
            name,
            file,
        } => {
            let response = swift::storage::download(ctx, &container, &name).await?;
            let mut stream = response.into_stream();
            let mut output = tokio::fs::File::create(&file)
                .await
                .with_context(|| format!("cannot create {:?}", file))?;
            let mut written = 0;
            while let Some(chunk) = stream.try_next().await? {
                output.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            output.flush().await?;
            Ok(format!(
                "downloaded {}/{} ({})",
                container,
                name,
                bytesize::ByteSize(written)
            ))
        }
        Command::Delete { container, name } => {
            swift::storage::delete_file(ctx, &container, &name).await?;
            Ok(format!("deleted {}/{}", container, name))
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<String> {
    let remotes = match &args.remotes {
        Some(path) => swift::Remotes::load(path)?,
        None => swift::Remotes::load_default()?,
    };
    let credentials = remotes
        .credentials(&args.remote)
        .with_context(|| format!("cannot configure remote '{}'", args.remote))?;
    let transport = Arc::new(swift::HttpTransport::new(Default::default())?);
    let ctx = swift::Context::build(credentials, transport)
        .await
        .with_context(|| format!("cannot open a session on remote '{}'", args.remote))?;
    execute(&ctx, args.command).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: true,
    };
    let tracing = common::TracingConfig {
        trace_identifier: "swc".to_string(),
        ..Default::default()
    };
    let res = common::run(
        None,
        output,
        common::RuntimeConfig::default(),
        common::ThrottleConfig::default(),
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swift::testutils::MemoryStore;

    #[tokio::test]
    async fn upload_list_download_delete() -> Result<()> {
        let store = MemoryStore::new();
        let ctx = store.context("tenant").await?;
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("notes.txt");
        tokio::fs::write(&local, b"remember the milk").await?;
        execute(
            &ctx,
            Command::Mkcontainer {
                container: "docs".to_string(),
                public: true,
            },
        )
        .await?;
        let uploaded = execute(
            &ctx,
            Command::Upload {
                container: "docs".to_string(),
                file: local.clone(),
                name: None,
                content_type: Some("text/plain".to_string()),
            },
        )
        .await?;
        assert!(uploaded.starts_with("uploaded docs/notes.txt"));
        let listing = execute(
            &ctx,
            Command::List {
                container: "docs".to_string(),
                prefix: None,
                long: false,
            },
        )
        .await?;
        assert_eq!(listing, "notes.txt");
        let headers = execute(
            &ctx,
            Command::Head {
                container: Some("docs".to_string()),
                name: None,
            },
        )
        .await?;
        assert!(headers.contains("x-container-read: .r:*"));
        let copy = dir.path().join("copy.txt");
        execute(
            &ctx,
            Command::Download {
                container: "docs".to_string(),
                name: "notes.txt".to_string(),
                file: copy.clone(),
            },
        )
        .await?;
        assert_eq!(tokio::fs::read(&copy).await?, b"remember the milk");
        execute(
            &ctx,
            Command::Delete {
                container: "docs".to_string(),
                name: "notes.txt".to_string(),
            },
        )
        .await?;
        assert!(store.object("tenant", "docs", "notes.txt").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn temp_url_requires_a_key() -> Result<()> {
        let store = MemoryStore::new();
        let ctx = store.context("tenant").await?;
        store.create_container("tenant", "docs");
        let temp_url = Command::TempUrl {
            container: "docs".to_string(),
            name: "notes.txt".to_string(),
            method: "get".to_string(),
            ttl: std::time::Duration::from_secs(60),
        };
        let error = execute(&ctx, temp_url.clone()).await.unwrap_err();
        assert!(error.to_string().contains("missing secret key"));
        execute(
            &ctx,
            Command::TempKey {
                container: "docs".to_string(),
                key: "k3y".to_string(),
            },
        )
        .await?;
        let url = execute(&ctx, temp_url).await?;
        assert!(url.starts_with("https://swift.test/v1/AUTH_tenant/docs/notes.txt?temp_url_sig="));
        assert!(url.contains("&temp_url_expires="));
        Ok(())
    }
}
