use super::*;

#[test]
fn test_default_config() {
    let config = DaemonConfig::default();
    assert_eq!(config.node.role, NodeRole::Hub);
    assert_eq!(config.hub.max_edges, 16);
    assert_eq!(config.edge.listen.port, 64738);
    assert!(config.hub.users.is_empty());
}

#[test]
fn test_parse_edge_file() {
    let config: DaemonConfig = toml::from_str(
        r#"
        [node]
        role = "edge"
        id = "edge-eu-1"

        [transport]
        protocol = "reliable_udp"
        host = "hub.internal"
        port = 7000

        [edge]
        advertise = "voice.example.org:64738"

        [[edge.channels]]
        id = 5
        name = "Lobby"

        [[edge.channels]]
        id = 6
        parent = 5
        name = "Raid"

        [auth]
        backend = "hub"
        "#,
    )
    .unwrap();

    assert_eq!(config.node.role, NodeRole::Edge);
    assert_eq!(config.transport.port, 7000);
    assert_eq!(config.edge.channels.len(), 2);
    assert_eq!(config.edge.channels[1].parent, Some(5));
    config.validate().unwrap();
}

#[test]
fn test_merge_scalars() {
    let mut config = DaemonConfig::default();
    let mut other = DaemonConfig::default();
    other.node.role = NodeRole::Edge;
    other.hub.max_edges = 2;

    config.merge(other);

    assert_eq!(config.node.role, NodeRole::Edge);
    assert_eq!(config.hub.max_edges, 2);
}

#[test]
fn test_merge_options() {
    let mut config = DaemonConfig::default();
    let mut other = DaemonConfig::default();
    other.hub.bind = Some("0.0.0.0:7000".to_string());

    config.merge(other);
    assert_eq!(config.hub.bind, Some("0.0.0.0:7000".to_string()));
}

#[test]
fn test_merge_channels() {
    let mut config = DaemonConfig::default();
    config.edge.channels.push(ChannelConfig {
        id: 1,
        parent: None,
        name: "Lobby".to_string(),
    });

    let mut other = DaemonConfig::default();
    // Update existing
    other.edge.channels.push(ChannelConfig {
        id: 1,
        parent: None,
        name: "Main".to_string(),
    });
    // Add new
    other.edge.channels.push(ChannelConfig {
        id: 2,
        parent: Some(1),
        name: "AFK".to_string(),
    });

    config.merge(other);

    assert_eq!(config.edge.channels.len(), 2);
    assert_eq!(config.edge.channels[0].name, "Main");
    assert_eq!(config.edge.channels[1].parent, Some(1));
}

#[test]
fn test_hub_rejects_zero_edges() {
    let mut config = DaemonConfig::default();
    config.auth.backend = "directory".to_string();
    config.validate().unwrap();

    config.hub.max_edges = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_hub_cannot_forward_to_itself() {
    let config = DaemonConfig::default();
    assert!(config.validate().is_err());
}

#[test]
fn test_parity_without_data_is_rejected() {
    let mut config = DaemonConfig::default();
    config.auth.backend = "directory".to_string();
    config.transport.protocol = chorus_transport::Protocol::ReliableUdp;
    config.transport.reliable_udp.data_shards = 0;
    config.transport.reliable_udp.parity_shards = 2;

    assert!(config.validate().is_err());
}

#[test]
fn test_edge_channel_tree_checked() {
    let mut config = DaemonConfig::default();
    config.node.role = NodeRole::Edge;
    config.edge.channels.push(ChannelConfig {
        id: 3,
        parent: Some(9),
        name: "Orphan".to_string(),
    });
    assert!(config.validate().is_err());

    config.edge.channels[0].parent = None;
    config.validate().unwrap();

    config.edge.channels.push(ChannelConfig {
        id: 3,
        parent: None,
        name: "Twin".to_string(),
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_acl_rule_subjects() {
    let rule = AclRule {
        channel: Some(5),
        subject: "group:admin".to_string(),
        allow: vec!["kick".to_string(), "ban".to_string()],
        deny: vec![],
    };
    let entry = rule.to_entry().unwrap();
    assert_eq!(entry.subject, AclSubject::Group("admin".to_string()));
    assert_eq!(entry.allow, Permissions::KICK.0 | Permissions::BAN.0);

    let user = AclRule {
        subject: "user:42".to_string(),
        ..rule.clone()
    };
    assert_eq!(user.to_entry().unwrap().subject, AclSubject::User(42));

    let bad = AclRule {
        subject: "robots".to_string(),
        ..rule.clone()
    };
    assert!(bad.to_entry().is_err());

    let unknown_permission = AclRule {
        allow: vec!["fly".to_string()],
        ..rule
    };
    assert!(unknown_permission.to_entry().is_err());
}

#[test]
fn test_bind_override() {
    let hub = HubConfig {
        bind: Some("127.0.0.1:7100".to_string()),
        ..HubConfig::default()
    };
    let listen = hub.listen_config(&TransportConfig::default()).unwrap();
    assert_eq!(listen.host, "127.0.0.1");
    assert_eq!(listen.port, 7100);
}
