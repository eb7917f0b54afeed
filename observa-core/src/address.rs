//! Address book entries announced by the broker
//!
//! The broker tells every client which devices exist (`device` lines) and
//! which interactive users are logged in (`client` lines). Both lists are
//! kept here and owned by the [`crate::Block`].

use observa_protocol::DeviceType;

/// Where a named device can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Number of the broker connection that announced this device
    host_num: i32,
    /// Broker number the device registered with
    centrald_num: i32,
    /// Broker assigned id of the device
    centrald_id: i32,
    name: String,
    host: String,
    port: u16,
    device_type: DeviceType,
}

impl NetworkAddress {
    pub fn new(
        host_num: i32,
        centrald_num: i32,
        centrald_id: i32,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        device_type: DeviceType,
    ) -> Self {
        Self {
            host_num,
            centrald_num,
            centrald_id,
            name: name.into(),
            host: host.into(),
            port,
            device_type,
        }
    }

    /// Same device announced by the same broker?
    pub fn is_address(&self, centrald_num: i32, name: &str) -> bool {
        self.centrald_num == centrald_num && self.name == name
    }

    /// Overwrite the location and identity with a fresh announcement.
    pub fn update(&mut self, other: &NetworkAddress) {
        self.host_num = other.host_num;
        self.centrald_id = other.centrald_id;
        self.host = other.host.clone();
        self.port = other.port;
        self.device_type = other.device_type;
    }

    pub fn host_num(&self) -> i32 {
        self.host_num
    }

    pub fn centrald_num(&self) -> i32 {
        self.centrald_num
    }

    pub fn centrald_id(&self) -> i32 {
        self.centrald_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// `host:port` form accepted by the resolver
    pub fn socket_spec(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A logged-in user as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnUser {
    centrald_id: i32,
    login: String,
    name: String,
}

impl ConnUser {
    pub fn new(centrald_id: i32, login: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            centrald_id,
            login: login.into(),
            name: name.into(),
        }
    }

    /// Update login and name when the id matches. Returns false otherwise.
    pub fn update(&mut self, centrald_id: i32, login: &str, name: &str) -> bool {
        if self.centrald_id != centrald_id {
            return false;
        }
        self.login = login.to_string();
        self.name = name.to_string();
        true
    }

    pub fn centrald_id(&self) -> i32 {
        self.centrald_id
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of [`AddressBook::add_address`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    Added,
    Updated,
}

/// Known devices and users, in announcement order.
#[derive(Debug, Default)]
pub struct AddressBook {
    addresses: Vec<NetworkAddress>,
    users: Vec<ConnUser>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address, or update the entry with the same broker number and name.
    pub fn add_address(&mut self, address: NetworkAddress) -> AddressChange {
        match self
            .addresses
            .iter_mut()
            .find(|a| a.is_address(address.centrald_num, &address.name))
        {
            Some(existing) => {
                existing.update(&address);
                AddressChange::Updated
            }
            None => {
                self.addresses.push(address);
                AddressChange::Added
            }
        }
    }

    /// Remove the entry with this broker number and name.
    pub fn delete_address(&mut self, centrald_num: i32, name: &str) -> Option<NetworkAddress> {
        let pos = self
            .addresses
            .iter()
            .position(|a| a.is_address(centrald_num, name))?;
        Some(self.addresses.remove(pos))
    }

    /// First address carrying this device name, whichever broker announced it.
    pub fn find_address(&self, name: &str) -> Option<&NetworkAddress> {
        self.addresses.iter().find(|a| a.name == name)
    }

    pub fn find_address_num(&self, centrald_num: i32, name: &str) -> Option<&NetworkAddress> {
        self.addresses
            .iter()
            .find(|a| a.is_address(centrald_num, name))
    }

    pub fn addresses(&self) -> &[NetworkAddress] {
        &self.addresses
    }

    /// Add a user, or refresh the entry with the same broker id.
    pub fn add_client(&mut self, centrald_id: i32, login: &str, name: &str) {
        if self
            .users
            .iter_mut()
            .any(|u| u.update(centrald_id, login, name))
        {
            return;
        }
        self.users.push(ConnUser::new(centrald_id, login, name));
    }

    pub fn delete_client(&mut self, centrald_id: i32) -> Option<ConnUser> {
        let pos = self
            .users
            .iter()
            .position(|u| u.centrald_id == centrald_id)?;
        Some(self.users.remove(pos))
    }

    pub fn find_client(&self, centrald_id: i32) -> Option<&ConnUser> {
        self.users.iter().find(|u| u.centrald_id == centrald_id)
    }

    pub fn users(&self) -> &[ConnUser] {
        &self.users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teld(host: &str, port: u16) -> NetworkAddress {
        NetworkAddress::new(0, 0, 3, "T0", host, port, DeviceType::Mount)
    }

    // ==================== Address Tests ====================

    #[test]
    fn test_add_address_then_update() {
        let mut book = AddressBook::new();
        assert_eq!(book.add_address(teld("mount.local", 5555)), AddressChange::Added);
        assert_eq!(book.add_address(teld("10.0.0.7", 5560)), AddressChange::Updated);

        assert_eq!(book.addresses().len(), 1);
        let addr = book.find_address("T0").unwrap();
        assert_eq!(addr.socket_spec(), "10.0.0.7:5560");
        assert_eq!(addr.device_type(), DeviceType::Mount);
    }

    #[test]
    fn test_same_name_from_other_broker_is_separate() {
        let mut book = AddressBook::new();
        book.add_address(teld("a", 1));
        book.add_address(NetworkAddress::new(1, 1, 9, "T0", "b", 2, DeviceType::Mount));

        assert_eq!(book.addresses().len(), 2);
        assert_eq!(book.find_address_num(1, "T0").unwrap().host(), "b");
    }

    #[test]
    fn test_delete_address() {
        let mut book = AddressBook::new();
        book.add_address(teld("a", 1));
        assert!(book.delete_address(1, "T0").is_none());
        assert!(book.delete_address(0, "T0").is_some());
        assert!(book.find_address("T0").is_none());
    }

    // ==================== User Tests ====================

    #[test]
    fn test_add_client_updates_by_id() {
        let mut book = AddressBook::new();
        book.add_client(12, "petr", "console");
        book.add_client(12, "petr", "monitor");
        book.add_client(13, "anna", "console");

        assert_eq!(book.users().len(), 2);
        assert_eq!(book.find_client(12).unwrap().name(), "monitor");
        assert_eq!(book.delete_client(13).unwrap().login(), "anna");
        assert!(book.delete_client(13).is_none());
    }
}
