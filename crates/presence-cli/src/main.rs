use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    fn mark_attendance(&self, image: &[u8], latitude: f64, longitude: f64) -> zbus::Result<String>;
    fn add_user(&self, name: &str) -> zbus::Result<i64>;
    fn enroll(&self, user_id: i64, images: Vec<String>) -> zbus::Result<u32>;
    fn clear_enrollment(&self, user_id: i64) -> zbus::Result<u32>;
    fn set_office_location(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
        address: &str,
    ) -> zbus::Result<String>;
    fn refresh_gallery(&self) -> zbus::Result<u32>;
    fn sweep_absentees(&self) -> zbus::Result<u32>;
    fn attendance(&self, date: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Register enrollment photos for a user
    Enroll {
        /// User id returned by `presence user add`
        user_id: i64,
        /// Photos of the user's face (at least one)
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Drop the user's existing photos first
        #[arg(long)]
        replace: bool,
    },
    /// Manage the office location
    Office {
        #[command(subcommand)]
        command: OfficeCommands,
    },
    /// Check in with a photo and coordinates
    #[command(allow_negative_numbers = true)]
    Mark {
        /// Photo to check in with
        image: PathBuf,
        latitude: f64,
        longitude: f64,
    },
    /// List attendance records for a day
    Report {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Rebuild the gallery from every enrollment photo
    Refresh,
    /// Mark users without a record today as absent
    Sweep,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add { name: String },
}

#[derive(Subcommand)]
enum OfficeCommands {
    /// Set or replace the office location
    #[command(allow_negative_numbers = true)]
    Set {
        latitude: f64,
        longitude: f64,
        /// Geofence radius in metres
        #[arg(short, long, default_value_t = 100.0)]
        radius: f64,
        /// Address label (reverse-geocoded when omitted)
        #[arg(short, long, default_value = "")]
        address: String,
    },
}

fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    tracing::debug!(system_bus = cli.system, "connected to D-Bus");
    let proxy = PresenceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::User {
            command: UserCommands::Add { name },
        } => {
            let user_id = proxy.add_user(&name).await?;
            println!("Added user {name} with id {user_id}");
        }
        Commands::Enroll {
            user_id,
            images,
            replace,
        } => {
            let paths = images.iter().map(|p| absolute(p)).collect::<Result<Vec<_>>>()?;
            if replace {
                let removed = proxy.clear_enrollment(user_id).await?;
                println!("Removed {removed} existing photo(s)");
            }
            let references = proxy.enroll(user_id, paths).await?;
            if references == 0 {
                bail!("no face found in any enrollment photo for user {user_id}");
            }
            println!("User {user_id} now has {references} reference embedding(s)");
        }
        Commands::Office {
            command:
                OfficeCommands::Set {
                    latitude,
                    longitude,
                    radius,
                    address,
                },
        } => {
            let office = proxy
                .set_office_location(latitude, longitude, radius, &address)
                .await?;
            print_json(&office)?;
        }
        Commands::Mark {
            image,
            latitude,
            longitude,
        } => {
            let bytes = std::fs::read(&image).with_context(|| format!("cannot read {}", image.display()))?;
            image::guess_format(&bytes).with_context(|| format!("{} is not an image", image.display()))?;
            let outcome = proxy.mark_attendance(&bytes, latitude, longitude).await?;
            print_json(&outcome)?;
        }
        Commands::Report { date } => {
            let records = proxy.attendance(date.as_deref().unwrap_or("")).await?;
            print_json(&records)?;
        }
        Commands::Refresh => {
            let identities = proxy.refresh_gallery().await?;
            println!("Gallery rebuilt: {identities} identities");
        }
        Commands::Sweep => {
            let marked = proxy.sweep_absentees().await?;
            println!("Marked {marked} user(s) absent");
        }
        Commands::Status => {
            let status = proxy.status().await?;
            print_json(&status)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_accepts_negative_coordinates() {
        let cli = Cli::try_parse_from(["presence", "mark", "me.jpg", "-33.8688", "-151.2093"]).unwrap();
        match cli.command {
            Commands::Mark {
                latitude, longitude, ..
            } => {
                assert_eq!(latitude, -33.8688);
                assert_eq!(longitude, -151.2093);
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_office_set_defaults() {
        let cli = Cli::try_parse_from(["presence", "--system", "office", "set", "27.7", "85.3"]).unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Office {
                command: OfficeCommands::Set { radius, address, .. },
            } => {
                assert_eq!(radius, 100.0);
                assert!(address.is_empty());
            }
            _ => panic!("expected office set"),
        }
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["presence", "enroll", "3"]).is_err());
        let cli = Cli::try_parse_from(["presence", "enroll", "3", "a.jpg", "b.jpg", "--replace"]).unwrap();
        assert!(matches!(cli.command, Commands::Enroll { user_id: 3, replace: true, ref images } if images.len() == 2));
    }
}
