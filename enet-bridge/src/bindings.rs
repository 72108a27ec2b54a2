//! Runtime binding loader: resolves the four managed data carriers and their constructors once,
//! pins them, and releases them on unload. Load is all-or-nothing.

use crate::managed::{
    ClassSpec, ManagedRuntime, ADDRESS_CLASS, EVENT_CLASS, PACKET_CLASS, PEER_CLASS,
};

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("managed class {0} not found")]
    MissingClass(&'static str),
    #[error("constructor {signature} not found on {class}")]
    MissingConstructor {
        class: &'static str,
        signature: &'static str,
    },
    #[error("bindings are not loaded")]
    NotLoaded,
}

pub struct Binding<R: ManagedRuntime> {
    pub class: R::Class,
    pub ctor: R::Ctor,
}

pub struct Resolved<R: ManagedRuntime> {
    pub event: Binding<R>,
    pub peer: Binding<R>,
    pub address: Binding<R>,
    pub packet: Binding<R>,
}

/// Cached class/constructor bindings. Constructed at attach, threaded into every marshaling call.
pub struct Bindings<R: ManagedRuntime> {
    resolved: Option<Resolved<R>>,
}

fn resolve<R: ManagedRuntime>(
    runtime: &mut R,
    spec: ClassSpec,
) -> Result<(R::Class, R::Ctor), BindingError> {
    let class = runtime
        .find_class(spec.name)
        .ok_or(BindingError::MissingClass(spec.name))?;
    let ctor = runtime
        .get_constructor(&class, spec.constructor)
        .ok_or(BindingError::MissingConstructor {
            class: spec.name,
            signature: spec.constructor,
        })?;
    Ok((class, ctor))
}

fn pin<R: ManagedRuntime>(runtime: &mut R, (class, ctor): (R::Class, R::Ctor)) -> Binding<R> {
    Binding {
        class: runtime.new_global_ref(&class),
        ctor,
    }
}

impl<R: ManagedRuntime> Bindings<R> {
    /// Resolve every class and constructor before pinning any, so a failure leaves nothing behind.
    pub fn load(runtime: &mut R) -> Result<Self, BindingError> {
        let event = resolve(runtime, EVENT_CLASS)?;
        let peer = resolve(runtime, PEER_CLASS)?;
        let address = resolve(runtime, ADDRESS_CLASS)?;
        let packet = resolve(runtime, PACKET_CLASS)?;
        let resolved = Resolved {
            event: pin(runtime, event),
            peer: pin(runtime, peer),
            address: pin(runtime, address),
            packet: pin(runtime, packet),
        };
        tracing::debug!("managed bindings loaded");
        Ok(Self {
            resolved: Some(resolved),
        })
    }

    /// Release the pinned classes. Idempotent.
    pub fn unload(&mut self, runtime: &mut R) {
        if let Some(r) = self.resolved.take() {
            runtime.delete_global_ref(r.event.class);
            runtime.delete_global_ref(r.peer.class);
            runtime.delete_global_ref(r.address.class);
            runtime.delete_global_ref(r.packet.class);
            tracing::debug!("managed bindings unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn resolved(&self) -> Result<&Resolved<R>, BindingError> {
        self.resolved.as_ref().ok_or(BindingError::NotLoaded)
    }
}
