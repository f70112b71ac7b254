use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secureface_core::{params, PipelineParams};
use secureface_store::Store;
use std::path::{Path, PathBuf};

mod enroll;
mod faces;
mod search;

use faces::Models;

#[zbus::proxy(
    interface = "org.secureface.Control1",
    default_service = "org.secureface.Control1",
    default_path = "/org/secureface/Control1"
)]
trait Control {
    fn set_parameter(&self, field: &str, value: &str) -> zbus::Result<String>;
    fn get_parameters(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn reload_gallery(&self) -> zbus::Result<u32>;
    fn restart_capture(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "secureface", about = "SecureFace access-control CLI")]
struct Cli {
    /// SQLite database (default: $SECUREFACE_DB_PATH or ~/.local/share/secureface/secureface.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update one live parameter on the running daemon
    Set {
        /// Parameter name, e.g. recognition_threshold or processing_mode
        field: String,
        value: String,
    },
    /// Show the daemon's current parameters
    Params,
    /// Show daemon status and counters
    Status,
    /// Make the daemon re-read enrolled people from the database
    ReloadGallery,
    /// Re-open the daemon's frame source
    RestartCapture,
    /// Manage roles
    #[command(subcommand)]
    Role(RoleCommand),
    /// Manage enrolled people
    #[command(subcommand)]
    User(UserCommand),
    /// Store a reference embedding for a user from an image file, or enroll
    /// every image in a directory as a new user named after the file
    Enroll {
        #[arg(short, long, required_unless_present = "dir", requires = "image")]
        user: Option<i64>,
        #[arg(short, long, required_unless_present = "dir")]
        image: Option<PathBuf>,
        #[arg(long, conflicts_with_all = ["user", "image"], requires = "role")]
        dir: Option<PathBuf>,
        /// Role name or identifier for users created from a directory
        #[arg(short, long)]
        role: Option<String>,
        #[arg(short, long)]
        department: Option<String>,
        /// Stop after this many users were enrolled from a directory
        #[arg(long)]
        limit: Option<usize>,
        /// The image is already an aligned face crop; skip detection
        #[arg(long)]
        aligned: bool,
        /// Directory holding the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Find the enrolled people closest to the face in an image
    Search {
        #[arg(short, long, required_unless_present = "dir", conflicts_with = "dir")]
        image: Option<PathBuf>,
        /// Search for every image in a directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Stop after this many images from a directory
        #[arg(long)]
        limit: Option<usize>,
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
        #[arg(long)]
        aligned: bool,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Show recent access decisions
    Logs {
        #[arg(short, long)]
        user: Option<i64>,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
    /// List V4L2 capture devices
    Cameras,
}

#[derive(Subcommand)]
enum RoleCommand {
    List,
    Add {
        name: String,
        access_level: i32,
        #[arg(short, long)]
        description: Option<String>,
    },
    SetLevel {
        role: String,
        access_level: i32,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    List,
    Add {
        full_name: String,
        /// Role name or identifier
        #[arg(short, long)]
        role: String,
        #[arg(short, long)]
        department: Option<String>,
    },
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Set { field, value } => {
            let proxy = connect().await?;
            let params = proxy.set_parameter(&field, &value).await?;
            println!("{field} = {value}");
            print_json(&params)?;
        }
        Commands::Params => print_json(&connect().await?.get_parameters().await?)?,
        Commands::Status => match daemon_status().await {
            Ok(status) => print_json(&status)?,
            Err(e) => {
                tracing::debug!(error = %e, "daemon unreachable");
                println!("securefaced: not connected");
            }
        },
        Commands::ReloadGallery => {
            let n = connect().await?.reload_gallery().await?;
            println!("gallery reloaded: {n} enrolled people");
        }
        Commands::RestartCapture => {
            connect().await?.restart_capture().await?;
            println!("capture restarted");
        }
        Commands::Role(cmd) => role_command(&open_store(&db)?, cmd)?,
        Commands::User(cmd) => user_command(&open_store(&db)?, cmd)?,
        Commands::Enroll {
            user,
            image,
            dir,
            role,
            department,
            limit,
            aligned,
            model_dir,
        } => {
            let store = open_store(&db)?;
            let params = embedding_params().await?;

            match (user, image, dir) {
                (Some(user), Some(image), _) => {
                    // Fail before loading models if the user does not exist.
                    store.get_user(user)?;
                    let mut models = Models::load(&resolve_model_dir(model_dir), aligned)?;
                    let face = models.embed_file(&image, &params)?;
                    let summary = enroll::enroll_face(&store, user, &face, Some(&image))?;
                    println!(
                        "enrolled user {user} ({} reference embeddings)",
                        summary.reference_count
                    );
                    if let Some(confidence) = summary.detection_confidence {
                        println!("face confidence {confidence:.3}");
                    }
                }
                (_, _, Some(dir)) => {
                    let role_id = resolve_role(&store, role.as_deref().unwrap_or_default())?;
                    let files = secureface_hw::list_images(&dir)
                        .with_context(|| format!("failed to list {}", dir.display()))?;
                    let mut models = Models::load(&resolve_model_dir(model_dir), aligned)?;
                    let summary = enroll::enroll_batch(&store, &files, role_id, department.as_deref(), limit, |path| {
                        models.embed_file(path, &params)
                    })?;
                    for (id, path) in &summary.enrolled {
                        println!("{id:>5}  {}", path.display());
                    }
                    for (path, reason) in &summary.failed {
                        println!("skipped {}: {reason}", path.display());
                    }
                    println!(
                        "enrolled {} of {} images",
                        summary.enrolled.len(),
                        summary.enrolled.len() + summary.failed.len()
                    );
                }
                _ => bail!("enroll needs --user with --image, or --dir"),
            }

            match daemon_reload().await {
                Ok(n) => println!("daemon gallery reloaded: {n} enrolled people"),
                Err(e) => {
                    tracing::debug!(error = %e, "daemon reload skipped");
                    println!("daemon not reachable; it loads the gallery on start or on `secureface reload-gallery`");
                }
            }
        }
        Commands::Search {
            image,
            dir,
            limit,
            top_k,
            aligned,
            json,
            model_dir,
        } => {
            let store = open_store(&db)?;
            let gallery = store.load_gallery()?;
            let params = embedding_params().await?;
            let mut queries = match (image, dir) {
                (Some(image), _) => vec![image],
                (None, Some(dir)) => secureface_hw::list_images(&dir)
                    .with_context(|| format!("failed to list {}", dir.display()))?,
                (None, None) => bail!("search needs --image or --dir"),
            };
            if let Some(n) = limit {
                queries.truncate(n);
            }

            let mut models = Models::load(&resolve_model_dir(model_dir), aligned)?;
            let single = queries.len() == 1;
            for query in &queries {
                let face = match models.embed_file(query, &params) {
                    Ok(face) => face,
                    Err(e) if !single => {
                        println!("{}: {e:#}", query.display());
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let hits = search::search(&store, &gallery, &face.embedding, top_k)?;
                if json {
                    let out = serde_json::json!({ "query": query, "matches": hits });
                    println!("{out}");
                    continue;
                }
                println!("{}", query.display());
                if hits.is_empty() {
                    println!("  no enrolled people");
                }
                for h in &hits {
                    println!(
                        "  {:>2}. {:>5}  {:<24} {:<10} level {:>4}  {:<12} {:.4}",
                        h.rank,
                        h.person_id,
                        h.full_name,
                        h.role,
                        h.access_level,
                        h.department.as_deref().unwrap_or("-"),
                        h.similarity
                    );
                }
            }
        }
        Commands::Logs { user, limit } => {
            let store = open_store(&db)?;
            for log in store.list_logs(user, limit)? {
                let e = &log.entry;
                println!(
                    "{:>6}  {}  cam{:<3} {:<8} {:>6}  {}",
                    log.id,
                    e.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    e.camera_id,
                    e.decision,
                    e.person_id.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    e.confidence.map_or_else(|| "-".to_string(), |c| format!("{c:.4}")),
                );
            }
        }
        Commands::Cameras => {
            let devices = secureface_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} (driver {}, bus {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<ControlProxy<'static>> {
    let conn = zbus::Connection::session().await?;
    ControlProxy::new(&conn)
        .await
        .context("securefaced is not reachable on the session bus")
}

async fn daemon_status() -> Result<String> {
    Ok(connect().await?.status().await?)
}

async fn daemon_reload() -> Result<u32> {
    Ok(connect().await?.reload_gallery().await?)
}

/// Parameters the daemon embeds with: its live snapshot when it is
/// reachable, otherwise the configured ones.
async fn embedding_params() -> Result<PipelineParams> {
    match connect().await {
        Ok(proxy) => match proxy.get_parameters().await {
            Ok(text) => return Ok(serde_json::from_str(&text)?),
            Err(e) => tracing::debug!(error = %e, "daemon parameters unavailable"),
        },
        Err(e) => tracing::debug!(error = %e, "daemon unreachable; using configured parameters"),
    }
    let text = match std::env::var("SECUREFACE_CONFIG") {
        Ok(path) => Some(std::fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?),
        Err(_) => None,
    };
    configured_params(text.as_deref(), |key| std::env::var(key).ok())
}

/// The `[params]` table of a daemon config file and `SECUREFACE_<FIELD>`
/// variables over the defaults, as the daemon layers them.
fn configured_params<F>(config_text: Option<&str>, env: F) -> Result<PipelineParams>
where
    F: Fn(&str) -> Option<String>,
{
    let table = match config_text {
        Some(text) => {
            let mut doc: toml::Table = toml::from_str(text)?;
            match doc.remove("params") {
                Some(toml::Value::Table(table)) => Some(table),
                Some(_) => bail!("[params] must be a table"),
                None => None,
            }
        }
        None => None,
    };
    Ok(params::layered(table.as_ref(), env)?)
}

fn resolve_model_dir(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| std::env::var("SECUREFACE_MODEL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(secureface_core::default_model_dir)
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn default_db_path() -> PathBuf {
    if let Ok(p) = std::env::var("SECUREFACE_DB_PATH") {
        return PathBuf::from(p);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("secureface/secureface.db")
}

fn open_store(path: &Path) -> Result<Store> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Store::open(path).with_context(|| format!("failed to open {}", path.display()))
}

/// Accept a role by identifier or by name.
fn resolve_role(store: &Store, role: &str) -> Result<i64> {
    let record = match role.parse::<i64>() {
        Ok(id) => store.get_role(id)?,
        Err(_) => store.role_by_name(role)?,
    };
    Ok(record.role.id)
}

fn role_command(store: &Store, cmd: RoleCommand) -> Result<()> {
    match cmd {
        RoleCommand::List => {
            for r in store.list_roles()? {
                println!(
                    "{:>4}  {:<16} level {:>4}  {}",
                    r.role.id,
                    r.role.name,
                    r.role.access_level,
                    r.description.as_deref().unwrap_or("")
                );
            }
        }
        RoleCommand::Add {
            name,
            access_level,
            description,
        } => {
            let role = store.create_role(&name, access_level, description.as_deref())?;
            println!("created role {} ({}) with level {}", role.id, role.name, role.access_level);
        }
        RoleCommand::SetLevel { role, access_level } => {
            let id = resolve_role(store, &role)?;
            store.set_access_level(id, access_level)?;
            println!("role {id} now has level {access_level}; reload the gallery to apply");
        }
    }
    Ok(())
}

fn user_command(store: &Store, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::List => {
            for u in store.list_users()? {
                println!(
                    "{:>5}  {:<24} role {:>3}  refs {:>2}  {}",
                    u.id,
                    u.full_name,
                    u.role_id,
                    store.count_embeddings(u.id)?,
                    u.department.as_deref().unwrap_or("")
                );
            }
        }
        UserCommand::Add {
            full_name,
            role,
            department,
        } => {
            if full_name.trim().is_empty() {
                bail!("full name must not be empty");
            }
            let role_id = resolve_role(store, &role)?;
            let user = store.create_user(&full_name, role_id, department.as_deref())?;
            println!("created user {} ({})", user.id, user.full_name);
        }
        UserCommand::Delete { id } => {
            store.delete_user(id)?;
            println!("deleted user {id}; existing log rows are kept");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set() {
        let cli = Cli::try_parse_from(["secureface", "set", "recognition_threshold", "0.7"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Set { ref field, ref value } if field == "recognition_threshold" && value == "0.7"
        ));
    }

    #[test]
    fn test_parse_enroll_and_global_db() {
        let cli = Cli::try_parse_from([
            "secureface", "enroll", "--user", "3", "--image", "face.png", "--aligned", "--db", "/tmp/x.db",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Enroll { user, aligned, .. } => {
                assert_eq!(user, Some(3));
                assert!(aligned);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_parse_enroll_dir_needs_role() {
        assert!(Cli::try_parse_from(["secureface", "enroll", "--dir", "faces/"]).is_err());
        assert!(Cli::try_parse_from(["secureface", "enroll", "--user", "3"]).is_err());
        let cli = Cli::try_parse_from(["secureface", "enroll", "--dir", "faces/", "--role", "Employee", "--limit", "20"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Enroll { limit: Some(20), .. }));
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from(["secureface", "search", "--image", "q.jpg", "-k", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Search { top_k: 3, .. }));
        assert!(Cli::try_parse_from(["secureface", "search"]).is_err());
        assert!(Cli::try_parse_from(["secureface", "search", "--image", "q.jpg", "--dir", "d"]).is_err());
    }

    #[test]
    fn test_configured_params_follow_daemon_layering() {
        let text = r#"
            db_path = "/var/lib/secureface/db.sqlite"

            [params]
            convert_to_rgb = false
            face_margin_ratio = 0.3
        "#;
        let env = |key: &str| (key == "SECUREFACE_FACE_MARGIN_RATIO").then(|| "0.5".to_string());
        let p = configured_params(Some(text), env).unwrap();
        assert!(!p.convert_to_rgb);
        assert!((p.margin_ratio - 0.5).abs() < 1e-6);

        assert_eq!(configured_params(None, |_| None).unwrap(), PipelineParams::default());
        assert!(configured_params(Some("params = 3"), |_| None).is_err());
    }

    #[test]
    fn test_resolve_role_by_name_or_id() {
        let store = Store::open_in_memory().unwrap();
        let by_name = resolve_role(&store, "Security").unwrap();
        assert_eq!(resolve_role(&store, &by_name.to_string()).unwrap(), by_name);
        assert!(resolve_role(&store, "Janitor").is_err());
    }

    #[test]
    fn test_user_add_and_delete() {
        let store = Store::open_in_memory().unwrap();
        user_command(
            &store,
            UserCommand::Add {
                full_name: "Grace".into(),
                role: "Employee".into(),
                department: Some("Ops".into()),
            },
        )
        .unwrap();
        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].department.as_deref(), Some("Ops"));

        user_command(&store, UserCommand::Delete { id: users[0].id }).unwrap();
        assert!(store.list_users().unwrap().is_empty());
    }
}
