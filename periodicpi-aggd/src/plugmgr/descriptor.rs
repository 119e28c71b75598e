//! Static driver metadata and the trait every loaded driver implements.
//!
//! A [`ModuleDescriptor`] is built once, when the driver table is scanned,
//! and never changes afterwards. Its property and method tables are what the
//! RPC layer lists and validates against before dispatching into the driver.

use std::fmt;
use std::sync::Arc;
use serde::Serialize;
use serde_json::Value;
use super::{Kwargs, ManagerError, ManagerResult, ModuleHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModuleCapability {
    /// More than one instance may be loaded at a time, named `name-N`
    MultiInstanceAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleArgument {
    pub name: String,
    pub help: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Float,
    String,
    Bool,
    Void,
    Dict,
    IntList,
    FloatList,
    StringList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyPermissions {
    Read,
    Write,
    ReadWrite,
}

impl PropertyPermissions {
    pub fn can_read(self) -> bool {
        matches!(self, PropertyPermissions::Read | PropertyPermissions::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, PropertyPermissions::Write | PropertyPermissions::ReadWrite)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub help: String,
    pub permissions: PropertyPermissions,
    pub data_type: DataType,
}

impl PropertyDescriptor {
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        permissions: PropertyPermissions,
        data_type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            permissions,
            data_type,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodArgument {
    pub name: String,
    pub help: String,
    pub required: bool,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub help: String,
    pub args: Vec<MethodArgument>,
    pub returns: DataType,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, help: impl Into<String>, returns: DataType) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            args: Vec::new(),
            returns,
        }
    }

    pub fn arg(
        mut self,
        name: impl Into<String>,
        help: impl Into<String>,
        required: bool,
        data_type: DataType,
    ) -> Self {
        self.args.push(MethodArgument {
            name: name.into(),
            help: help.into(),
            required,
            data_type,
        });
        self
    }

    /// Verify every required argument is present in `args`
    pub fn check_arguments(&self, args: &Kwargs) -> ManagerResult<()> {
        match self.args.iter().find(|a| a.required && !args.contains_key(&a.name)) {
            Some(missing) => Err(ManagerError::InvalidArguments(format!(
                "{}: missing argument {}",
                self.name, missing.name
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub help: String,
    pub capabilities: Vec<ModuleCapability>,
    pub required_args: Vec<ModuleArgument>,
    pub optional_args: Vec<ModuleArgument>,
    pub properties: Vec<PropertyDescriptor>,
    pub methods: Vec<MethodDescriptor>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            capabilities: Vec::new(),
            required_args: Vec::new(),
            optional_args: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn capability(mut self, capability: ModuleCapability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn required(mut self, name: impl Into<String>, help: impl Into<String>) -> Self {
        self.required_args.push(ModuleArgument {
            name: name.into(),
            help: help.into(),
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, help: impl Into<String>) -> Self {
        self.optional_args.push(ModuleArgument {
            name: name.into(),
            help: help.into(),
        });
        self
    }

    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn allows_multiple_instances(&self) -> bool {
        self.capabilities.contains(&ModuleCapability::MultiInstanceAllowed)
    }

    /// Verify that every required load argument is present
    pub fn check_arguments(&self, kwargs: &Kwargs) -> ManagerResult<()> {
        match self.required_args.iter().find(|a| !kwargs.contains_key(&a.name)) {
            Some(missing) => Err(ManagerError::load(
                &self.name,
                format!("missing argument: {}", missing.name),
            )),
            None => Ok(()),
        }
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A live driver instance.
///
/// Property and method calls only reach the driver after the manager has
/// checked them against the descriptor tables, so implementations can treat
/// an unexpected name as a programming error and answer `NotAvailable`.
pub trait Module: Send {
    /// Release driver resources. Called once, before the instance is dropped.
    fn unload(&mut self) {}

    fn get_property(&self, name: &str) -> ManagerResult<Value> {
        Err(ManagerError::NotAvailable(name.to_string()))
    }

    fn set_property(&mut self, name: &str, _value: Value) -> ManagerResult<()> {
        Err(ManagerError::NotAvailable(name.to_string()))
    }

    fn call_method(&mut self, name: &str, _args: &Kwargs) -> ManagerResult<Value> {
        Err(ManagerError::NotAvailable(name.to_string()))
    }
}

pub type ModuleFactory =
    Arc<dyn Fn(ModuleHandle, &Kwargs) -> ManagerResult<Box<dyn Module>> + Send + Sync>;

/// A descriptor paired with the factory that builds its instances.
#[derive(Clone)]
pub struct ModuleClass {
    pub descriptor: ModuleDescriptor,
    factory: ModuleFactory,
}

impl ModuleClass {
    pub fn new<F>(descriptor: ModuleDescriptor, factory: F) -> Self
    where
        F: Fn(ModuleHandle, &Kwargs) -> ManagerResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            factory: Arc::new(factory),
        }
    }

    pub(crate) fn instantiate(
        &self,
        handle: ModuleHandle,
        kwargs: &Kwargs,
    ) -> ManagerResult<Box<dyn Module>> {
        (self.factory)(handle, kwargs)
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClass")
            .field("descriptor", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}
