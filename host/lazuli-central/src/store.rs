//! Peer information stores
//!
//! Querying a peer's version, features, and attribute directory costs round trips on every
//! connection. A [`PeerStore`] keeps that information across connections (and, if the caller
//! persists it, across sessions) keyed by the peer's device address. The store is handed to the
//! [`Central`](crate::Central) at construction, so tests and embedders choose freely between
//! the in-memory store, no store at all, or their own persistent implementation.

use lazuli_core::BluetoothDeviceAddress;
use lazuli_gatt::Directory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The version information of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

/// The LE feature mask of a remote device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeFeatures(pub [u8; 8]);

impl LeFeatures {
    /// Check a feature by its bit position within the mask
    pub fn is_set(&self, bit: usize) -> bool {
        self.0
            .get(bit / 8)
            .map(|byte| byte & (1 << (bit % 8)) != 0)
            .unwrap_or(false)
    }
}

/// Remote device information gathered when a connection is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub version: RemoteVersion,
    pub features: LeFeatures,
}

/// A store of per-peer information
pub trait PeerStore: Send {
    fn remote_info(&self, peer: BluetoothDeviceAddress) -> Option<RemoteInfo>;

    fn set_remote_info(&mut self, peer: BluetoothDeviceAddress, info: RemoteInfo);

    fn directory(&self, peer: BluetoothDeviceAddress) -> Option<Directory>;

    fn set_directory(&mut self, peer: BluetoothDeviceAddress, directory: Directory);
}

/// A `PeerStore` kept in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    remote_info: HashMap<BluetoothDeviceAddress, RemoteInfo>,
    directories: HashMap<BluetoothDeviceAddress, Directory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl PeerStore for MemoryStore {
    fn remote_info(&self, peer: BluetoothDeviceAddress) -> Option<RemoteInfo> {
        self.remote_info.get(&peer).copied()
    }

    fn set_remote_info(&mut self, peer: BluetoothDeviceAddress, info: RemoteInfo) {
        self.remote_info.insert(peer, info);
    }

    fn directory(&self, peer: BluetoothDeviceAddress) -> Option<Directory> {
        self.directories.get(&peer).cloned()
    }

    fn set_directory(&mut self, peer: BluetoothDeviceAddress, directory: Directory) {
        self.directories.insert(peer, directory);
    }
}

/// A `PeerStore` that stores nothing
///
/// With this store every connection queries the peer afresh.
#[derive(Debug, Default)]
pub struct NoStore;

impl PeerStore for NoStore {
    fn remote_info(&self, _: BluetoothDeviceAddress) -> Option<RemoteInfo> {
        None
    }

    fn set_remote_info(&mut self, _: BluetoothDeviceAddress, _: RemoteInfo) {}

    fn directory(&self, _: BluetoothDeviceAddress) -> Option<Directory> {
        None
    }

    fn set_directory(&mut self, _: BluetoothDeviceAddress, _: Directory) {}
}
