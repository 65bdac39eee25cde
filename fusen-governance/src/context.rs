use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::{
    model::{
        label::{Argument, Label},
        ServiceKey,
    },
    resolver::QueryParser,
    value::Value,
};

/// What the governance layer sees of one outgoing call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub service: ServiceKey,
    pub interface: String,
    pub method: String,
    pub attachments: HashMap<String, String>,
    pub caller_ip: Option<String>,
    pub caller_service: Option<ServiceKey>,
    pub arguments: Vec<Value>,
}

impl CallContext {
    pub fn new(service: ServiceKey, method: impl Into<String>) -> Self {
        Self {
            service,
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn caller_ip(mut self, caller_ip: impl Into<String>) -> Self {
        self.caller_ip = Some(caller_ip.into());
        self
    }

    pub fn caller_service(mut self, caller_service: ServiceKey) -> Self {
        self.caller_service = Some(caller_service);
        self
    }

    pub fn argument(mut self, argument: impl Into<Value>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Resolves the labels a rule asked for. Labels without a value on this
    /// call are left out.
    pub fn build_arguments(
        &self,
        labels: &BTreeSet<Label>,
        parser: &dyn QueryParser,
    ) -> BTreeSet<Argument> {
        let arguments: BTreeSet<Argument> = labels
            .iter()
            .filter_map(|label| {
                let value = self.label_value(label, parser)?;
                Some(Argument::new(label.clone(), value))
            })
            .collect();
        debug!(
            "arguments of {}#{}: {:?}",
            self.service, self.method, arguments
        );
        arguments
    }

    fn label_value(&self, label: &Label, parser: &dyn QueryParser) -> Option<String> {
        match label {
            Label::Method => non_blank(&self.method),
            Label::Path => non_blank(&self.interface),
            Label::CallerIp => self.caller_ip.as_deref().and_then(non_blank),
            Label::Header(name) | Label::Custom(name) => {
                self.attachments.get(name).and_then(|e| non_blank(e))
            }
            Label::Query(query) => parser.parse(query, &self.arguments),
            Label::CallerService(namespace) => self
                .caller_service
                .as_ref()
                .filter(|e| &e.namespace == namespace)
                .and_then(|e| non_blank(&e.service)),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    (!value.trim().is_empty()).then(|| value.to_owned())
}
