// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The VF inventory: root domain → PF → VF, captured once as the baseline.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IorError, IorResult};
use crate::vf::{DeviceClass, FcExtra, HotplugStatus, IbExtra, NicExtra, VfExtra, VfRecord};

/// A physical function and the VFs created on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalFunction {
    pub class: DeviceClass,
    pub vfs: BTreeMap<String, VfRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    roots: BTreeMap<String, BTreeMap<String, PhysicalFunction>>,
}

/// One VF per CSV row.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    root_domain: String,
    pf: String,
    vf: String,
    class: DeviceClass,
    alias: String,
    io_domain: String,
    hotplug_dev: String,
    hotplug_path: String,
    hotplug_port: String,
    hotplug_status: String,
    port_wwn: Option<String>,
    logical_path: Option<String>,
    mpxio: Option<bool>,
    io_active: Option<bool>,
    interface: Option<String>,
    link: Option<String>,
    part: Option<String>,
    ipmp_group: Option<String>,
    traffic_active: Option<bool>,
}

impl Row {
    fn new(root: &str, pf: &str, vf: &str, r: &VfRecord) -> Row {
        let mut row = Row {
            root_domain: root.to_string(),
            pf: pf.to_string(),
            vf: vf.to_string(),
            class: r.class(),
            alias: r.alias.clone(),
            io_domain: r.io_domain.clone(),
            hotplug_dev: r.hotplug_dev.clone(),
            hotplug_path: r.hotplug_path.clone(),
            hotplug_port: r.hotplug_port.clone(),
            hotplug_status: r.hotplug_status.to_string(),
            port_wwn: None,
            logical_path: None,
            mpxio: None,
            io_active: None,
            interface: None,
            link: None,
            part: None,
            ipmp_group: None,
            traffic_active: None,
        };
        match &r.extra {
            VfExtra::Fc(fc) => {
                row.port_wwn = Some(fc.port_wwn.clone());
                row.logical_path = fc.logical_path.clone();
                row.mpxio = Some(fc.mpxio);
                row.io_active = Some(fc.io_active);
            }
            VfExtra::Nic(nic) => {
                row.interface = Some(nic.interface.clone());
                row.ipmp_group = nic.ipmp_group.clone();
                row.traffic_active = Some(nic.traffic_active);
            }
            VfExtra::Ib(ib) => {
                row.link = Some(ib.link.clone());
                row.part = Some(ib.part.clone());
                row.ipmp_group = ib.ipmp_group.clone();
                row.traffic_active = Some(ib.traffic_active);
            }
        }
        row
    }

    fn required(&self, field: &str, value: &Option<String>) -> IorResult<String> {
        value.clone().ok_or_else(|| IorError::Parse {
            what: format!("{} of {}", field, self.vf),
            text: format!("{:?}", self),
        })
    }

    fn into_record(self) -> IorResult<VfRecord> {
        let extra = match self.class {
            DeviceClass::FibreChannel => VfExtra::Fc(FcExtra {
                port_wwn: self.required("port_wwn", &self.port_wwn)?,
                logical_path: self.logical_path.clone(),
                mpxio: self.mpxio.unwrap_or(false),
                io_active: self.io_active.unwrap_or(false),
            }),
            DeviceClass::Network => VfExtra::Nic(NicExtra {
                interface: self.required("interface", &self.interface)?,
                ipmp_group: self.ipmp_group.clone(),
                traffic_active: self.traffic_active.unwrap_or(false),
            }),
            DeviceClass::Infiniband => VfExtra::Ib(IbExtra {
                link: self.required("link", &self.link)?,
                part: self.required("part", &self.part)?,
                ipmp_group: self.ipmp_group.clone(),
                traffic_active: self.traffic_active.unwrap_or(false),
            }),
        };
        Ok(VfRecord {
            alias: self.alias,
            io_domain: self.io_domain,
            hotplug_dev: self.hotplug_dev,
            hotplug_path: self.hotplug_path,
            hotplug_port: self.hotplug_port,
            hotplug_status: HotplugStatus::from(self.hotplug_status.as_str()),
            extra,
        })
    }
}

impl Inventory {
    pub fn new() -> Inventory {
        Default::default()
    }

    pub fn insert(&mut self, root: &str, pf: &str, vf: &str, record: VfRecord) {
        let class = record.class();
        self.roots
            .entry(root.to_string())
            .or_default()
            .entry(pf.to_string())
            .or_insert_with(|| PhysicalFunction {
                class,
                vfs: BTreeMap::new(),
            })
            .vfs
            .insert(vf.to_string(), record);
    }

    pub fn root_domains(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    pub fn pfs(&self, root: &str) -> Option<&BTreeMap<String, PhysicalFunction>> {
        self.roots.get(root)
    }

    pub fn get(&self, vf: &str) -> Option<&VfRecord> {
        self.roots
            .values()
            .flat_map(|pfs| pfs.values())
            .find_map(|pf| pf.vfs.get(vf))
    }

    /// Every VF assigned to `io_domain`, from any root domain.
    pub fn vfs_in_io_domain(&self, io_domain: &str) -> BTreeMap<String, VfRecord> {
        self.roots
            .values()
            .flat_map(|pfs| pfs.values())
            .flat_map(|pf| pf.vfs.iter())
            .filter(|(_vf, r)| r.io_domain == io_domain)
            .map(|(vf, r)| (vf.clone(), r.clone()))
            .collect()
    }

    /// VFs of the faulted `roots` that are assigned to `io_domain`.
    pub fn test_vfs(&self, roots: &[&str], io_domain: &str) -> IorResult<BTreeMap<String, VfRecord>> {
        let mut vfs = BTreeMap::new();
        for root in roots {
            let pfs = self.roots.get(*root).ok_or_else(|| IorError::UnknownDomain {
                domain: root.to_string(),
            })?;
            for pf in pfs.values() {
                for (vf, r) in pf.vfs.iter().filter(|(_vf, r)| r.io_domain == io_domain) {
                    vfs.insert(vf.clone(), r.clone());
                }
            }
        }
        Ok(vfs)
    }

    pub fn from_reader<R: Read>(reader: R) -> IorResult<Inventory> {
        let mut inventory = Inventory::new();
        let mut rdr = csv::Reader::from_reader(reader);
        for row in rdr.deserialize() {
            let row: Row = row?;
            let (root, pf, vf) = (row.root_domain.clone(), row.pf.clone(), row.vf.clone());
            inventory.insert(&root, &pf, &vf, row.into_record()?);
        }
        Ok(inventory)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> IorResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for (root, pfs) in &self.roots {
            for (pf, function) in pfs {
                for (vf, record) in &function.vfs {
                    wtr.serialize(Row::new(root, pf, vf, record))?;
                }
            }
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> IorResult<Inventory> {
        let file = std::fs::File::open(path)?;
        Inventory::from_reader(file)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> IorResult<()> {
        let file = std::fs::File::create(path)?;
        self.to_writer(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fc(iod: &str, port: &str, logical: Option<&str>) -> VfRecord {
        VfRecord {
            alias: format!("/SYS/MB/PCIE4/IOVFC.PF0.{}", port),
            io_domain: iod.to_string(),
            hotplug_dev: format!("/pci@380/pci@1/pci@0/pci@6/SUNW,qlc@0,{}", port),
            hotplug_path: "/pci@380/pci@1/pci@0/pci@6".into(),
            hotplug_port: format!("pci.0,{}", port),
            hotplug_status: HotplugStatus::Online,
            extra: VfExtra::Fc(FcExtra {
                port_wwn: format!("10000090fa1c4e3{}", port),
                logical_path: logical.map(str::to_string),
                mpxio: logical.is_some(),
                io_active: false,
            }),
        }
    }

    fn sample() -> Inventory {
        let mut inv = Inventory::new();
        inv.insert("nprd-a", "/SYS/MB/PCIE4/IOVFC.PF0", "/SYS/MB/PCIE4/IOVFC.PF0.VF0", fc("fc-iod1", "1", Some("/dev/rdsk/c1t5d0s2")));
        inv.insert("nprd-a", "/SYS/MB/PCIE4/IOVFC.PF0", "/SYS/MB/PCIE4/IOVFC.PF0.VF1", fc("fc-iod2", "2", None));
        inv.insert("nprd-b", "/SYS/MB/PCIE6/IOVNET.PF0", "/SYS/MB/PCIE6/IOVNET.PF0.VF0", VfRecord {
            alias: "/SYS/MB/PCIE6/IOVNET.PF0.VF0".into(),
            io_domain: "fc-iod1".into(),
            hotplug_dev: "/pci@400/pci@2/pci@0/pci@4/network@0,1".into(),
            hotplug_path: "/pci@400/pci@2/pci@0/pci@4".into(),
            hotplug_port: "pci.0,1".into(),
            hotplug_status: HotplugStatus::Online,
            extra: VfExtra::Nic(NicExtra {
                interface: "net2".into(),
                ipmp_group: Some("ipmp0".into()),
                traffic_active: true,
            }),
        });
        inv
    }

    #[test]
    fn lookups() {
        let inv = sample();
        assert_eq!(inv.root_domains().collect::<Vec<_>>(), vec!["nprd-a", "nprd-b"]);
        assert_eq!(inv.vfs_in_io_domain("fc-iod1").len(), 2);

        let tests = inv.test_vfs(&["nprd-a"], "fc-iod1").unwrap();
        assert_eq!(tests.keys().collect::<Vec<_>>(), vec!["/SYS/MB/PCIE4/IOVFC.PF0.VF0"]);
        assert!(inv.test_vfs(&["nprd-c"], "fc-iod1").is_err());

        let nic = inv.get("/SYS/MB/PCIE6/IOVNET.PF0.VF0").unwrap();
        assert_eq!(nic.class(), DeviceClass::Network);
        assert!(nic.ipmp_flag());
    }

    #[test]
    fn csv_persistence() {
        let inv = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfs_info.csv");
        inv.save(&path).unwrap();
        assert_eq!(Inventory::load(&path).unwrap(), inv);
    }

    #[test]
    fn fc_row_without_wwn_is_rejected() {
        let csv = "root_domain,pf,vf,class,alias,io_domain,hotplug_dev,hotplug_path,hotplug_port,hotplug_status,port_wwn,logical_path,mpxio,io_active,interface,link,part,ipmp_group,traffic_active\n\
nprd-a,PF0,VF0,FIBRECHANNEL,VF0,fc-iod1,\"/pci@380/x@0,1\",/pci@380,\"pci.0,1\",ONLINE,,,,,,,,,\n";
        assert!(Inventory::from_reader(csv.as_bytes()).is_err());
    }
}
