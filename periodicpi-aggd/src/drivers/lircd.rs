use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;
use serde_json::{json, Value};
use thiserror::Error;
use crate::plugmgr::{
    kwargs_port, kwargs_str, DataType, Kwargs, ManagerError, ManagerResult, MethodDescriptor,
    Module, ModuleCapability, ModuleClass, ModuleDescriptor, ModuleHandle, PropertyDescriptor,
    PropertyPermissions,
};
use super::DriverContext;

pub const NAME: &str = "lircd";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LircError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unexpected reply from lircd: {0}")]
    Protocol(String),

    #[error("lircd rejected {command}: {message}")]
    Command { command: String, message: String },
}

/// Client for the lircd socket protocol.
///
/// Every command opens its own connection. Replies are
/// `BEGIN / <command> / SUCCESS|ERROR / [DATA / n / n lines] / END`.
pub struct LircClient {
    address: String,
    port: u16,
}

impl LircClient {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
        }
    }

    pub fn command(&self, command: &str) -> Result<Vec<String>, LircError> {
        let stream = TcpStream::connect((self.address.as_str(), self.port))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(format!("{}\n", command).as_bytes())?;
        writer.flush()?;

        let mut lines = BufReader::new(stream).lines();
        loop {
            let block = read_block(&mut lines)?;
            // lircd may interleave broadcasts such as SIGHUP
            if block.first().map(String::as_str) != Some(command) {
                continue;
            }
            return parse_reply(command, &block);
        }
    }

    pub fn list_remotes(&self) -> Result<Vec<String>, LircError> {
        self.command("LIST")
    }

    /// Key names of a remote; lircd lists them as `<code> <name>`
    pub fn list_keys(&self, remote: &str) -> Result<Vec<String>, LircError> {
        Ok(self
            .command(&format!("LIST {}", remote))?
            .into_iter()
            .filter_map(|line| line.split_whitespace().last().map(str::to_string))
            .collect())
    }

    pub fn send_once(&self, remote: &str, key: &str, repeat: u32) -> Result<(), LircError> {
        let command = if repeat > 0 {
            format!("SEND_ONCE {} {} {}", remote, key, repeat)
        } else {
            format!("SEND_ONCE {} {}", remote, key)
        };
        self.command(&command).map(|_| ())
    }

    pub fn send_start(&self, remote: &str, key: &str) -> Result<(), LircError> {
        self.command(&format!("SEND_START {} {}", remote, key)).map(|_| ())
    }

    pub fn send_stop(&self, remote: &str, key: &str) -> Result<(), LircError> {
        self.command(&format!("SEND_STOP {} {}", remote, key)).map(|_| ())
    }
}

/// Lines between `BEGIN` and `END`, exclusive
fn read_block<B: BufRead>(lines: &mut io::Lines<B>) -> Result<Vec<String>, LircError> {
    let mut next = || -> Result<String, LircError> {
        match lines.next() {
            Some(line) => Ok(line?.trim_end().to_string()),
            None => Err(LircError::Protocol("connection closed mid-reply".into())),
        }
    };

    let begin = next()?;
    if begin != "BEGIN" {
        return Err(LircError::Protocol(format!("expected BEGIN, got {:?}", begin)));
    }
    let mut block = Vec::new();
    loop {
        let line = next()?;
        if line == "END" {
            return Ok(block);
        }
        block.push(line);
    }
}

fn parse_reply(command: &str, block: &[String]) -> Result<Vec<String>, LircError> {
    let status = block.get(1).map(String::as_str);
    let data = match block.get(2).map(String::as_str) {
        Some("DATA") => {
            let count: usize = block
                .get(3)
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| LircError::Protocol("missing DATA length".into()))?;
            block.iter().skip(4).take(count).cloned().collect()
        }
        _ => Vec::new(),
    };

    match status {
        Some("SUCCESS") => Ok(data),
        Some("ERROR") => Err(LircError::Command {
            command: command.to_string(),
            message: data.join(" "),
        }),
        other => Err(LircError::Protocol(format!("unknown status {:?}", other))),
    }
}

struct Lircd {
    handle: ModuleHandle,
    client: LircClient,
}

impl Lircd {
    fn driver_error(&self, e: LircError) -> ManagerError {
        ManagerError::driver(self.handle.id(), e)
    }
}

impl Module for Lircd {
    fn get_property(&self, name: &str) -> ManagerResult<Value> {
        match name {
            "server_address" => Ok(json!(self.client.address)),
            "server_port" => Ok(json!(self.client.port)),
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }

    fn call_method(&mut self, name: &str, args: &Kwargs) -> ManagerResult<Value> {
        match name {
            "get_remotes" => {
                let remotes = self.client.list_remotes().map_err(|e| self.driver_error(e))?;
                Ok(json!(remotes))
            }
            "get_remote_actions" => {
                let remote = kwargs_str(args, "remote_name")?;
                let keys = self.client.list_keys(remote).map_err(|e| self.driver_error(e))?;
                Ok(json!(keys))
            }
            "send_remote_key" => {
                let remote = kwargs_str(args, "remote_name")?;
                let key = kwargs_str(args, "key_name")?;
                let repeat = args
                    .get("repeat_count")
                    .and_then(Value::as_u64)
                    .and_then(|r| u32::try_from(r).ok())
                    .unwrap_or(0);
                self.client
                    .send_once(remote, key, repeat)
                    .map_err(|e| self.driver_error(e))?;
                Ok(Value::Null)
            }
            "start_key_press" => {
                let (remote, key) = (kwargs_str(args, "remote_name")?, kwargs_str(args, "key_name")?);
                self.client.send_start(remote, key).map_err(|e| self.driver_error(e))?;
                Ok(Value::Null)
            }
            "stop_key_press" => {
                let (remote, key) = (kwargs_str(args, "remote_name")?, kwargs_str(args, "key_name")?);
                self.client.send_stop(remote, key).map_err(|e| self.driver_error(e))?;
                Ok(Value::Null)
            }
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }
}

fn key_method(name: &str, help: &str) -> MethodDescriptor {
    MethodDescriptor::new(name, help, DataType::Void)
        .arg("remote_name", "remote name", true, DataType::String)
        .arg("key_name", "key name", true, DataType::String)
}

fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, "lircd client driver")
        .capability(ModuleCapability::MultiInstanceAllowed)
        .required("server_address", "lircd server address")
        .required("server_port", "lircd server port")
        .property(PropertyDescriptor::new(
            "server_address",
            "lircd server address",
            PropertyPermissions::Read,
            DataType::String,
        ))
        .property(PropertyDescriptor::new(
            "server_port",
            "lircd server port",
            PropertyPermissions::Read,
            DataType::Int,
        ))
        .method(MethodDescriptor::new(
            "get_remotes",
            "Remotes configured at this location",
            DataType::StringList,
        ))
        .method(
            MethodDescriptor::new("get_remote_actions", "Keys of one remote", DataType::StringList)
                .arg("remote_name", "remote name", true, DataType::String),
        )
        .method(
            key_method("send_remote_key", "Send a key once")
                .arg("repeat_count", "extra repeats", false, DataType::Int),
        )
        .method(key_method("start_key_press", "Start holding a key"))
        .method(key_method("stop_key_press", "Release a held key"))
}

pub fn discover(_ctx: &DriverContext) -> anyhow::Result<ModuleClass> {
    Ok(ModuleClass::new(descriptor(), |handle, args| {
        let address = kwargs_str(args, "server_address")?;
        let port = kwargs_port(args, "server_port")?;
        handle.log_info(format!("lircd client for {}:{}", address, port));
        Ok(Box::new(Lircd {
            client: LircClient::new(address, port),
            handle,
        }))
    }))
}
