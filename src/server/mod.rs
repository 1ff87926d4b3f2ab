//! Single-threaded request loop over a Unix-domain socket.
//!
//! Connections are served one at a time and commands complete synchronously,
//! so every project database sees exclusive-writer access. Workers run as
//! separate processes and push their parsed sub-projects in through
//! `UPDATE_TRANSLATION_UNIT`. Every core error is converted into a failure
//! status and the loop keeps serving; only `SHUT_DOWN` ends the process.

pub mod protocol;

use crate::config::Config;
use crate::db::project::ProjectDb;
use crate::db::record::Record;
use crate::storage::file_name_table::FileNameTable;
use crate::storage::StoreResult;

use protocol::{Command, QueryQualifier, QueryType, Status, StatusType};

use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

pub struct Server {
    config: Config,
    projects: HashMap<String, ProjectDb>,

    /// Project roots interned as paths; maps a directory back to the
    /// project that owns it.
    roots: FileNameTable,
    by_root: HashMap<u32, String>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            projects: HashMap::new(),
            roots: FileNameTable::new(),
            by_root: HashMap::new(),
        }
    }

    /// Serves one connection to completion. Returns `true` when the peer
    /// asked the server to shut down.
    pub async fn serve_connection<S>(&mut self, mut stream: S) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let command: Command = match protocol::read_message(&mut stream).await {
                Ok(command) => command,
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return false,
                Err(error) => {
                    warn!(%error, "malformed request; dropping connection");
                    return false;
                }
            };

            let payload = if command.carries_payload() {
                match protocol::read_frame(&mut stream).await {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        warn!(%error, "missing payload frame; dropping connection");
                        return false;
                    }
                }
            } else {
                None
            };

            let shutting_down = matches!(command, Command::ShutDown);
            let (status, reply_payload) = self.handle_command(command, payload);

            if let Err(error) = protocol::write_message(&mut stream, &status).await {
                warn!(%error, "failed to write reply");
                return shutting_down;
            }
            if let Some(bytes) = reply_payload {
                if let Err(error) = protocol::write_frame(&mut stream, &bytes).await {
                    warn!(%error, "failed to write reply payload");
                    return shutting_down;
                }
            }

            if shutting_down {
                return true;
            }
        }
    }

    pub fn handle_command(
        &mut self,
        command: Command,
        payload: Option<Vec<u8>>,
    ) -> (Status, Option<Vec<u8>>) {
        match command {
            Command::Ping => (Status::new(StatusType::Idle), None),

            Command::Query {
                project_name,
                directory_name,
                query_type,
                qualifier,
                symbol_name,
                file_name,
                line,
                column,
            } => self.handle_query(
                &project_name,
                &directory_name,
                query_type,
                qualifier,
                symbol_name.as_deref(),
                file_name.as_deref(),
                line,
                column,
            ),

            Command::DumpTranslationUnit {
                project_name,
                file_name,
            } => {
                let project = match self.find_project(&project_name, "") {
                    Some(project) => project,
                    None => return (Status::new(StatusType::UnknownProject), None),
                };
                match project.dump_translation_unit(&file_name) {
                    Ok(Some(records)) => package_records(project, &records),
                    Ok(None) => (
                        Status::with_remarks(
                            StatusType::QueryNoResults,
                            vec![format!("{file_name} is not indexed")],
                        ),
                        None,
                    ),
                    Err(error) => (Status::failure(error.to_string()), None),
                }
            }

            Command::UpdateTranslationUnit {
                project_name,
                directory_name,
                file_name,
            } => {
                let bytes = match payload {
                    Some(bytes) => bytes,
                    None => {
                        return (
                            Status::failure("update requires a serialized sub-project payload"),
                            None,
                        )
                    }
                };
                let sub_project = match ProjectDb::from_bytes(&bytes) {
                    Ok(sub_project) => sub_project,
                    Err(error) => return (Status::failure(error.to_string()), None),
                };

                debug!(
                    project = %project_name,
                    file = %file_name,
                    records = sub_project.record_count(),
                    "applying translation unit update"
                );

                let result = self
                    .get_or_create_project(&project_name, &directory_name)
                    .and_then(|project| project.update_from(&file_name, &sub_project));
                match result {
                    Ok(()) => (Status::new(StatusType::TranslationUnitUpdated), None),
                    Err(error) => (Status::failure(error.to_string()), None),
                }
            }

            Command::QueryStatistics {
                project_name,
                group,
            } => match self.find_project(&project_name, "") {
                Some(project) => (
                    Status::with_remarks(
                        StatusType::StatisticsRemarks,
                        project.statistics_remarks(&group),
                    ),
                    None,
                ),
                None => (Status::new(StatusType::UnknownProject), None),
            },

            Command::AnalyzeData {
                project_name,
                group,
            } => match self.find_project(&project_name, "") {
                Some(project) => (
                    Status::with_remarks(StatusType::StatisticsRemarks, project.analyze_data(&group)),
                    None,
                ),
                None => (Status::new(StatusType::UnknownProject), None),
            },

            Command::SaveDatabase {
                project_name,
                directory_name,
            } => {
                let project = match self.find_project(&project_name, &directory_name) {
                    Some(project) => project,
                    None => return (Status::new(StatusType::UnknownProject), None),
                };
                let path = self.config.project_database_path(project.root());
                match project.save_to_file(&path) {
                    Ok(()) => (
                        Status::with_remarks(
                            StatusType::StatisticsRemarks,
                            vec![format!(
                                "Saved project '{}' to {}",
                                project.name(),
                                path.display()
                            )],
                        ),
                        None,
                    ),
                    Err(error) => (Status::failure(error.to_string()), None),
                }
            }

            Command::LoadDatabase {
                project_name,
                directory_name,
            } => {
                let path = self.config.project_database_path(&directory_name);
                match ProjectDb::load_from_file(&path) {
                    Ok(project) => {
                        let remark = format!(
                            "Loaded project '{project_name}' from {}",
                            path.display()
                        );
                        match self.register_project(&project_name, &directory_name, project) {
                            Ok(()) => (
                                Status::with_remarks(StatusType::StatisticsRemarks, vec![remark]),
                                None,
                            ),
                            Err(error) => (Status::failure(error.to_string()), None),
                        }
                    }
                    Err(error) => (Status::failure(error.to_string()), None),
                }
            }

            Command::ShutDown => (Status::new(StatusType::ShuttingDown), None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_query(
        &self,
        project_name: &str,
        directory_name: &str,
        query_type: QueryType,
        qualifier: QueryQualifier,
        symbol_name: Option<&str>,
        file_name: Option<&str>,
        line: u32,
        column: u32,
    ) -> (Status, Option<Vec<u8>>) {
        let project = match self.find_project(project_name, directory_name) {
            Some(project) => project,
            None => return (Status::new(StatusType::UnknownProject), None),
        };

        let records = match query_type {
            QueryType::Symbol => {
                let name = symbol_name.unwrap_or("");
                match qualifier {
                    QueryQualifier::Any => project.find_symbol(name),
                    QueryQualifier::Declaration => project.find_declaration(name),
                    QueryQualifier::Definition => project.find_definition(name),
                    QueryQualifier::Reference => project.find_reference(name),
                }
            }
            QueryType::Identify => {
                project.identify_symbol(file_name.unwrap_or(""), line, column)
            }
        };

        match records {
            Ok(records) if records.is_empty() => (Status::new(StatusType::QueryNoResults), None),
            Ok(records) => package_records(project, &records),
            Err(error) => (Status::failure(error.to_string()), None),
        }
    }

    fn find_project(&self, project_name: &str, directory_name: &str) -> Option<&ProjectDb> {
        if let Some(project) = self.projects.get(project_name) {
            return Some(project);
        }
        let root_key = self.roots.get_key(directory_name);
        if root_key != 0 {
            if let Some(owner) = self.by_root.get(&root_key) {
                return self.projects.get(owner);
            }
        }
        None
    }

    fn get_or_create_project(
        &mut self,
        project_name: &str,
        directory_name: &str,
    ) -> StoreResult<&mut ProjectDb> {
        match self.projects.entry(project_name.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                info!(project = project_name, root = directory_name, "creating project");
                let root_key = self.roots.add_key(directory_name)?;
                if root_key != 0 {
                    self.by_root.insert(root_key, project_name.to_string());
                }
                Ok(entry.insert(ProjectDb::new(project_name, directory_name)))
            }
        }
    }

    fn register_project(
        &mut self,
        project_name: &str,
        directory_name: &str,
        project: ProjectDb,
    ) -> StoreResult<()> {
        let root_key = self.roots.add_key(directory_name)?;
        if root_key != 0 {
            self.by_root.insert(root_key, project_name.to_string());
        }
        self.projects.insert(project_name.to_string(), project);
        Ok(())
    }
}

fn package_records(project: &ProjectDb, records: &[&Record]) -> (Status, Option<Vec<u8>>) {
    match project
        .inflate_records(records)
        .and_then(|cursor_set| cursor_set.to_bytes())
    {
        Ok(bytes) => (
            Status::with_remarks(
                StatusType::QueryResults,
                vec![format!("{} records", records.len())],
            ),
            Some(bytes),
        ),
        Err(error) => (Status::failure(error.to_string()), None),
    }
}

/// Binds the request socket and serves connections until a client sends
/// `SHUT_DOWN`.
pub async fn run(config: Config) -> Result<()> {
    let socket_path = config.socket_path();
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // a stale socket from a previous run would make bind fail
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "listening for requests");

    let mut server = Server::new(config);
    loop {
        let (stream, _address) = listener.accept().await?;
        if server.serve_connection(stream).await {
            break;
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    info!("shut down");
    Ok(())
}
