use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const SESSION_FILE: &str = ".session";

#[derive(Parser)]
#[command(name = "cloudvault")]
#[command(about = "A CLI client for the cloud storage backend", long_about = None)]
struct Cli {
    #[arg(long, env = "CLOUDVAULT_URL", default_value = "http://localhost:3000", help = "Server base URL")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create a new account")]
    Register {
        #[arg(short, long, help = "Email address")]
        email: String,

        #[arg(short, long, help = "Password")]
        password: String,
    },

    #[command(about = "Log in and store the session token")]
    Login {
        #[arg(short, long, help = "Email address")]
        email: String,

        #[arg(short, long, help = "Password")]
        password: String,
    },

    #[command(about = "Forget the stored session token")]
    Logout,

    #[command(about = "Upload a file")]
    Upload {
        #[arg(short, long, help = "Path to the file")]
        file: PathBuf,

        #[arg(short, long, default_value = "", help = "Tags (comma-separated)")]
        tags: String,
    },

    #[command(about = "List your files")]
    List,

    #[command(about = "Download a file")]
    Download {
        #[arg(help = "File ID")]
        id: String,

        #[arg(short, long, help = "Output path (defaults to the stored filename)")]
        output: Option<PathBuf>,
    },

    #[command(about = "Delete a file")]
    Delete {
        #[arg(help = "File ID")]
        id: String,
    },

    #[command(about = "Search your files")]
    Search {
        #[arg(help = "Search query")]
        query: String,
    },

    #[command(about = "Show your search history")]
    History,
}

#[derive(Debug, Serialize, Deserialize)]
struct Session {
    token: String,
    user_id: String,
    email: String,
}

impl Session {
    fn save(&self) -> Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(SESSION_FILE, json).context("Failed to write session file")?;
        Ok(())
    }

    fn load() -> Option<Self> {
        let data = fs::read_to_string(SESSION_FILE).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn clear() -> Result<()> {
        if Path::new(SESSION_FILE).exists() {
            fs::remove_file(SESSION_FILE)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSummary {
    id: String,
    filename: String,
    #[serde(default)]
    tags: Vec<String>,
    uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    message: String,
    file: FileSummary,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    query: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: Vec<HistoryEntry>,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(cli.url);

    if let Err(e) = run_command(&client, cli.command).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_command(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Register { email, password } => register(client, &email, &password).await,
        Commands::Login { email, password } => login(client, &email, &password).await,
        Commands::Logout => {
            Session::clear()?;
            println!("✅ Logged out successfully!");
            Ok(())
        }
        Commands::Upload { file, tags } => upload(client, &require_login()?, &file, &tags).await,
        Commands::List => list(client, &require_login()?).await,
        Commands::Download { id, output } => download(client, &require_login()?, &id, output).await,
        Commands::Delete { id } => delete(client, &require_login()?, &id).await,
        Commands::Search { query } => search(client, &require_login()?, &query).await,
        Commands::History => history(client, &require_login()?).await,
    }
}

fn require_login() -> Result<Session> {
    Session::load()
        .ok_or_else(|| anyhow::anyhow!("You must be logged in. Use: cli login -e <email> -p <password>"))
}

/// Turns a non-2xx response into an error carrying the server's message.
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);

    if status == reqwest::StatusCode::FORBIDDEN {
        bail!("{} failed: {} (session expired? log in again)", action, message);
    }
    bail!("{} failed ({}): {}", action, status, message)
}

async fn register(client: &Client, email: &str, password: &str) -> Result<()> {
    let response = client
        .http
        .post(client.url("/auth/register"))
        .json(&Credentials { email, password })
        .send()
        .await?;
    check(response, "Registration").await?;

    println!("✅ Account created successfully!");
    println!("📧 Email: {}", email);
    println!("\n💡 You can now log in using: cli login -e {} -p <password>", email);
    Ok(())
}

async fn login(client: &Client, email: &str, password: &str) -> Result<()> {
    let response = client
        .http
        .post(client.url("/auth/login"))
        .json(&Credentials { email, password })
        .send()
        .await?;
    let result: LoginResponse = check(response, "Login").await?.json().await?;

    let session = Session {
        token: result.token,
        user_id: result.user_id,
        email: email.to_string(),
    };
    session.save()?;

    println!("✅ Login successful!");
    println!("👤 Welcome back, {}!", session.email);
    println!("🆔 User ID: {}", session.user_id);
    Ok(())
}

async fn upload(client: &Client, session: &Session, path: &Path, tags: &str) -> Result<()> {
    let content = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Path has no usable filename: {}", path.display()))?
        .to_string();

    let size = content.len();
    let form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(content).file_name(filename))
        .text("tags", tags.to_string());

    let response = client
        .http
        .post(client.url("/files/upload"))
        .bearer_auth(&session.token)
        .multipart(form)
        .send()
        .await?;
    let result: UploadResponse = check(response, "Upload").await?.json().await?;

    println!("✅ {}", result.message);
    println!("📄 Filename: {}", result.file.filename);
    println!("🆔 File ID: {}", result.file.id);
    println!("📊 Size: {} bytes", size);
    if !result.file.tags.is_empty() {
        println!("🏷️  Tags: {}", result.file.tags.join(", "));
    }
    Ok(())
}

async fn list(client: &Client, session: &Session) -> Result<()> {
    let response = client
        .http
        .get(client.url("/files/list"))
        .bearer_auth(&session.token)
        .send()
        .await?;
    let files: Vec<FileSummary> = check(response, "Listing").await?.json().await?;

    if files.is_empty() {
        println!("📭 No files uploaded yet.");
        println!("💡 Use 'cli upload -f <file> -t <tags>' to upload one");
        return Ok(());
    }

    println!("\n📚 Your files ({})\n", files.len());

    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("ID"),
        Cell::new("Filename"),
        Cell::new("Tags"),
        Cell::new("Uploaded"),
    ]));

    for file in files {
        let local_time = file.uploaded_at.with_timezone(&Local);
        table.add_row(Row::new(vec![
            Cell::new(&file.id),
            Cell::new(&file.filename),
            Cell::new(&file.tags.join(", ")),
            Cell::new(&local_time.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]));
    }

    table.printstd();
    println!();
    Ok(())
}

async fn download(client: &Client, session: &Session, id: &str, output: Option<PathBuf>) -> Result<()> {
    let response = client
        .http
        .get(client.url(&format!("/files/download/{}", id)))
        .bearer_auth(&session.token)
        .send()
        .await?;
    let response = check(response, "Download").await?;

    let output = match output {
        Some(path) => path,
        None => PathBuf::from(attachment_name(&response).unwrap_or_else(|| id.to_string())),
    };

    let bytes = response.bytes().await?;
    fs::write(&output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;

    println!("✅ Downloaded {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

fn attachment_name(response: &reqwest::Response) -> Option<String> {
    let value = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let name = value.split("filename=").nth(1)?.trim_matches('"');
    let name = Path::new(name).file_name()?.to_str()?;
    Some(name.to_string())
}

async fn delete(client: &Client, session: &Session, id: &str) -> Result<()> {
    let response = client
        .http
        .delete(client.url(&format!("/files/delete/{}", id)))
        .bearer_auth(&session.token)
        .send()
        .await?;
    check(response, "Delete").await?;

    println!("🗑️  File {} deleted", id);
    Ok(())
}

async fn search(client: &Client, session: &Session, query: &str) -> Result<()> {
    let response = client
        .http
        .get(client.url("/search"))
        .query(&[("q", query)])
        .bearer_auth(&session.token)
        .send()
        .await?;
    let body: Value = check(response, "Search").await?.json().await?;
    let results = body.get("results").cloned().unwrap_or(Value::Null);

    match results {
        Value::Array(items) if items.is_empty() => println!("🔍 No results for '{}'", query),
        Value::Array(items) => {
            println!("🔍 Results for '{}':\n", query);
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(name) => println!("{}. 📄 {}", i + 1, name),
                    None => println!("{}. {}", i + 1, item),
                }
            }
        }
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

async fn history(client: &Client, session: &Session) -> Result<()> {
    let response = client
        .http
        .get(client.url("/search/history"))
        .bearer_auth(&session.token)
        .send()
        .await?;
    let result: HistoryResponse = check(response, "History").await?.json().await?;

    if result.history.is_empty() {
        println!("📭 No searches yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(Row::new(vec![Cell::new("When"), Cell::new("Query")]));
    for entry in result.history {
        let local_time = entry.timestamp.with_timezone(&Local);
        table.add_row(Row::new(vec![
            Cell::new(&local_time.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(&entry.query),
        ]));
    }

    table.printstd();
    Ok(())
}
