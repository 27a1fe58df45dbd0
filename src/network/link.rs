//! Thin rtnetlink wrappers for bridge and link plumbing.
//!
//! All operations are idempotent: EEXIST on creation and ENODEV on
//! deletion are success. The route socket is opened in-process, so the
//! binary's own CAP_NET_ADMIN (or root) is what authorizes the calls.

use std::net::IpAddr;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use rtnetlink::Handle;
use tracing::debug;

/// One netlink connection per invocation, shared by every fabric call.
pub struct Netlink {
    handle: Handle,
}

fn netlink_errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => Some(-msg.raw_code()),
        _ => None,
    }
}

impl Netlink {
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("opening rtnetlink socket")?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Fetch a link by name, or None when the kernel reports ENODEV.
    pub async fn get_link(&self, name: &str) -> Result<Option<LinkMessage>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(link) => Ok(link),
            Err(e) if netlink_errno(&e) == Some(libc::ENODEV) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("querying link {name}")),
        }
    }

    pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.get_link(name).await?.map(|link| link.header.index))
    }

    pub async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_link(name).await?.is_some())
    }

    /// Create the bridge if absent and bring it up. Returns its index.
    pub async fn ensure_bridge(&self, name: &str) -> Result<u32> {
        if let Some(index) = self.link_index(name).await? {
            debug!(bridge = name, "bridge already exists");
            self.set_up(index).await?;
            return Ok(index);
        }

        let add = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;
        match add {
            Ok(()) => {}
            Err(e) if netlink_errno(&e) == Some(libc::EEXIST) => {
                debug!(bridge = name, "bridge appeared concurrently");
            }
            Err(e) => return Err(e).with_context(|| format!("failed to create bridge {name}")),
        }

        let index = self
            .link_index(name)
            .await?
            .with_context(|| format!("bridge {name} missing after creation"))?;
        self.set_up(index).await?;
        debug!(bridge = name, index, "bridge created");
        Ok(index)
    }

    pub async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .with_context(|| format!("bringing up link index {index}"))
    }

    pub async fn set_down(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .with_context(|| format!("bringing down link index {index}"))
    }

    /// Enslave a link to a bridge.
    pub async fn set_master(&self, index: u32, master_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(master_index)
            .execute()
            .await
            .with_context(|| format!("attaching link {index} to bridge {master_index}"))
    }

    /// Assign an address; "already exists" is success.
    pub async fn ensure_address(&self, index: u32, address: IpAddr, prefix_len: u8) -> Result<()> {
        let add = self
            .handle
            .address()
            .add(index, address, prefix_len)
            .execute()
            .await;
        match add {
            Ok(()) => Ok(()),
            Err(e) if netlink_errno(&e) == Some(libc::EEXIST) => {
                debug!(index, %address, "address already assigned");
                Ok(())
            }
            Err(e) => {
                Err(e).with_context(|| format!("assigning {address}/{prefix_len} to link {index}"))
            }
        }
    }

    /// Delete a link by name; already-absent links are silent success.
    pub async fn delete_link(&self, name: &str) -> Result<()> {
        let Some(index) = self.link_index(name).await? else {
            debug!(link = name, "link already absent");
            return Ok(());
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => {
                debug!(link = name, "link deleted");
                Ok(())
            }
            Err(e) if netlink_errno(&e) == Some(libc::ENODEV) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting link {name}")),
        }
    }

    /// Hardware address of a link, formatted `aa:bb:cc:dd:ee:ff`.
    pub async fn link_mac(&self, name: &str) -> Result<Option<String>> {
        let Some(link) = self.get_link(name).await? else {
            return Ok(None);
        };

        for attribute in &link.attributes {
            if let LinkAttribute::Address(bytes) = attribute {
                let mac = bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":");
                return Ok(Some(mac));
            }
        }
        Ok(None)
    }

    /// MTU of a link, for informational listings.
    pub async fn link_mtu(&self, name: &str) -> Result<Option<u32>> {
        let Some(link) = self.get_link(name).await? else {
            return Ok(None);
        };
        for attribute in &link.attributes {
            if let LinkAttribute::Mtu(mtu) = attribute {
                return Ok(Some(*mtu));
            }
        }
        Ok(None)
    }

    pub async fn link_is_up(&self, name: &str) -> Result<bool> {
        Ok(self
            .get_link(name)
            .await?
            .map(|link| link.header.flags.contains(&LinkFlag::Up))
            .unwrap_or(false))
    }

    /// Name of the bridge a link is attached to, if any.
    pub async fn link_master(&self, name: &str) -> Result<Option<String>> {
        let Some(link) = self.get_link(name).await? else {
            return Ok(None);
        };

        let mut master_index = None;
        for attribute in &link.attributes {
            if let LinkAttribute::Controller(index) = attribute {
                master_index = Some(*index);
            }
        }
        let Some(master_index) = master_index else {
            return Ok(None);
        };

        let mut links = self.handle.link().get().match_index(master_index).execute();
        let Some(master) = links.try_next().await.ok().flatten() else {
            return Ok(None);
        };
        for attribute in &master.attributes {
            if let LinkAttribute::IfName(master_name) = attribute {
                return Ok(Some(master_name.clone()));
            }
        }
        Ok(None)
    }

    /// Probe whether this process can create bridges (CAP_NET_ADMIN or
    /// root): create and immediately delete a scratch bridge.
    pub async fn can_create_bridges(&self) -> bool {
        const PROBE: &str = "qc-probe0";
        let created = self
            .handle
            .link()
            .add()
            .bridge(PROBE.to_string())
            .execute()
            .await;
        match created {
            Ok(()) => {
                let _ = self.delete_link(PROBE).await;
                true
            }
            Err(e) => netlink_errno(&e) == Some(libc::EEXIST),
        }
    }
}
