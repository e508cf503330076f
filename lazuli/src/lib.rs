//! A Bluetooth Low Energy host
//!
//! `lazuli` turns the raw packet stream of a Bluetooth controller into a usable central: scan
//! for advertisers, connect, and read and write the peer's attributes, without re-implementing
//! the wire protocols. The crate is a facade over the protocol layer crates; each layer can
//! also be used on its own.
//!
//! The layers, bottom to top:
//! * [`hci`] recombines packets from the interface byte stream and correlates commands with
//!   their completion events.
//! * [`l2cap`] frames, fragments, and recombines connection-oriented data under the
//!   controller's buffer credit.
//! * [`att`] runs attribute protocol transactions and surfaces server initiated value updates.
//! * [`gatt`] discovers the services, characteristics, and descriptors of a peer into an
//!   exportable directory.
//! * [`central`] ties them together into the central role state machine.
//!
//! Everything asynchronous runs on the caller's executor; the host performs no blocking I/O of
//! its own. The physical interface is not part of this crate: an interface driver writes the
//! packets produced by [`hci::Host`] to the controller and feeds everything it reads back into
//! [`hci::Host::feed`].

pub use lazuli_core::errors;
pub use lazuli_core::{BluetoothDeviceAddress, ConnectionHandle, Uuid};

pub use lazuli_att as att;
pub use lazuli_central as central;
pub use lazuli_gatt as gatt;
pub use lazuli_hci as hci;
pub use lazuli_l2cap as l2cap;
