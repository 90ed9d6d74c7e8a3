//! Schema declarations, descriptor resolution and the browsable key space

mod descriptor;
mod fragment;
mod view;

pub use descriptor::{
    DescriptorCache, FieldDescriptor, NoProperties, PropertyProvider, StaticProperties,
};
pub use fragment::{Prop, Schema, SchemaFragment};
pub use view::{SchemaStore, SchemaView, ViewEntry};
