//! HDF5 artifact backend (feature `storage_hdf5`).
//!
//! Files are readable from Python, MATLAB or Igor without this crate: every
//! channel is a group, every segment an `i16` dataset with `x0`/`dx`
//! attributes, and run metadata sits on the root group.

use hdf5::types::{TypeDescriptor, VarLenUnicode};
use hdf5::{File, Location};
use std::collections::BTreeMap;
use std::path::Path;

use super::{ArtifactWriter, AttrValue, ChannelGroup, IterationArtifact, SegmentDataset};
use crate::error::{AcqError, AppResult};

/// Writes artifacts as HDF5 files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5ArtifactWriter;

fn storage_err(err: hdf5::Error) -> AcqError {
    AcqError::Storage(err.to_string())
}

fn write_attr(location: &Location, name: &str, value: &AttrValue) -> hdf5::Result<()> {
    match value {
        AttrValue::Int(v) => location.new_attr::<i64>().create(name)?.write_scalar(v),
        AttrValue::Float(v) => location.new_attr::<f64>().create(name)?.write_scalar(v),
        AttrValue::Text(v) => {
            let text: VarLenUnicode = v
                .parse()
                .map_err(|e| hdf5::Error::from(format!("attribute {name}: {e}")))?;
            location
                .new_attr::<VarLenUnicode>()
                .create(name)?
                .write_scalar(&text)
        }
    }
}

fn read_attrs(location: &Location) -> hdf5::Result<BTreeMap<String, AttrValue>> {
    let mut attrs = BTreeMap::new();
    for name in location.attr_names()? {
        let attr = location.attr(&name)?;
        let value = match attr.dtype()?.to_descriptor()? {
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
                AttrValue::Int(attr.read_scalar::<i64>()?)
            }
            TypeDescriptor::Float(_) => AttrValue::Float(attr.read_scalar::<f64>()?),
            TypeDescriptor::VarLenUnicode => {
                AttrValue::Text(attr.read_scalar::<VarLenUnicode>()?.as_str().to_string())
            }
            other => {
                return Err(hdf5::Error::from(format!(
                    "attribute {name} has unsupported type {other:?}"
                )))
            }
        };
        attrs.insert(name, value);
    }
    Ok(attrs)
}

impl ArtifactWriter for Hdf5ArtifactWriter {
    fn format(&self) -> &'static str {
        "hdf5"
    }

    fn extension(&self) -> &'static str {
        "h5"
    }

    fn write(&self, artifact: &IterationArtifact, path: &Path) -> AppResult<()> {
        if path.exists() {
            return Err(AcqError::Storage(format!(
                "Refusing to overwrite {}",
                path.display()
            )));
        }

        let file = File::create(path).map_err(storage_err)?;
        for (name, value) in &artifact.attributes {
            write_attr(&file, name, value).map_err(storage_err)?;
        }

        for (group_name, channel) in &artifact.channels {
            let group = file.create_group(group_name).map_err(storage_err)?;
            for (name, value) in &channel.attributes {
                write_attr(&group, name, value).map_err(storage_err)?;
            }
            for (name, dataset) in &channel.datasets {
                let ds = group
                    .new_dataset::<i16>()
                    .create(name.as_str(), dataset.data.len())
                    .map_err(storage_err)?;
                if !dataset.data.is_empty() {
                    ds.write(&dataset.data).map_err(storage_err)?;
                }
                ds.new_attr::<f64>()
                    .create("x0")
                    .and_then(|attr| attr.write_scalar(&dataset.x0))
                    .map_err(storage_err)?;
                ds.new_attr::<f64>()
                    .create("dx")
                    .and_then(|attr| attr.write_scalar(&dataset.dx))
                    .map_err(storage_err)?;
            }
        }

        file.flush().map_err(storage_err)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> AppResult<IterationArtifact> {
        let file = File::open(path).map_err(storage_err)?;
        let mut artifact = IterationArtifact {
            attributes: read_attrs(&file).map_err(storage_err)?,
            channels: BTreeMap::new(),
        };

        for group_name in file.member_names().map_err(storage_err)? {
            let group = file.group(&group_name).map_err(storage_err)?;
            let mut channel = ChannelGroup {
                attributes: read_attrs(&group).map_err(storage_err)?,
                datasets: BTreeMap::new(),
            };
            for name in group.member_names().map_err(storage_err)? {
                let ds = group.dataset(&name).map_err(storage_err)?;
                let x0 = ds
                    .attr("x0")
                    .and_then(|a| a.read_scalar::<f64>())
                    .map_err(storage_err)?;
                let dx = ds
                    .attr("dx")
                    .and_then(|a| a.read_scalar::<f64>())
                    .map_err(storage_err)?;
                let data = if ds.size() == 0 {
                    Vec::new()
                } else {
                    ds.read_raw::<i16>().map_err(storage_err)?
                };
                channel
                    .datasets
                    .insert(name, SegmentDataset { x0, dx, data });
            }
            artifact.channels.insert(group_name, channel);
        }

        Ok(artifact)
    }
}
