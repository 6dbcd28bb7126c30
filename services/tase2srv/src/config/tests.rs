use super::*;

const PROTOCOL_STACK: &str = r#"{
    "protocol_stack": {
        "name": "tase2client",
        "version": "1.0",
        "transport_layer": {
            "connections": [
                {
                    "ip_addr": "127.0.0.1",
                    "port": 10002,
                    "tls": false,
                    "osi": {
                        "local_ap_title": "1.1.1.998",
                        "local_ae_qualifier": 12,
                        "remote_ap_title": "1,1,1,999",
                        "remote_ae_qualifier": 12,
                        "local_psel": "0x00 0x00 0x00 0x02",
                        "remote_tsel": "0x00 0x01"
                    }
                },
                { "ip_addr": "127.0.0.1", "port": 10003, "tls": "yes" },
                { "ip_addr": "not-an-address", "port": 10004 },
                { "ip_addr": "127.0.0.1", "port": 70000 }
            ],
            "backupTimeout": 1500,
            "failback": false
        },
        "application_layer": {
            "polling_interval": 1000,
            "datasets": [
                {
                    "dataset_ref": "DS1",
                    "domain": "icc1",
                    "entries": ["datapointReal", "datapointStateQ"],
                    "dynamic": true
                },
                { "domain": "icc1", "entries": ["orphan"] },
                { "dataset_ref": "DS2", "entries": ["x"] }
            ],
            "dataset_transfer_sets": [
                {
                    "name": "DSTS1",
                    "dataset_ref": "DS1",
                    "dsConditions": ["interval", "change", "unknown"],
                    "interval": 2,
                    "tle": 60,
                    "bufTm": 1,
                    "integrityCheck": 30,
                    "critical": true,
                    "rbe": true,
                    "allChangesReported": true,
                    "startTime": 0
                },
                { "domain": "icc1", "dataset_ref": "DS1" }
            ]
        }
    }
}"#;

const EXCHANGED_DATA: &str = r#"{
    "exchanged_data": {
        "datapoints": [
            { "label": "TS1", "protocols": [{ "name": "tase2", "ref": "icc1:datapointReal", "typeid": "Real" }] },
            { "label": "TS2", "protocols": [{ "name": "tase2", "ref": "icc1:datapointStateQ", "typeid": "StateQ" }] },
            { "label": "TS3", "protocols": [{ "name": "tase2", "ref": "icc1:datapointDiscrete", "typeid": "DiscreteQTime" }] },
            { "label": "TC1", "protocols": [{ "name": "tase2", "ref": "icc1:command1", "typeid": "Command" }] },
            { "label": "TC2", "protocols": [{ "name": "tase2", "ref": "icc1:setpoint1", "typeid": "SetPointReal" }] },
            { "label": "BAD1", "protocols": [{ "name": "tase2", "ref": "icc1:bad", "typeid": "Analog" }] },
            { "label": "BAD2", "protocols": [{ "name": "tase2", "ref": "nocolon", "typeid": "Real" }] },
            { "label": "OTHER", "protocols": [{ "name": "iec104", "ref": "x:y", "typeid": "Real" }] }
        ]
    }
}"#;

#[test]
fn test_protocol_import() {
    let mut config = ClientConfig::new();
    config.import_protocol_config(PROTOCOL_STACK).unwrap();
    assert!(config.protocol_complete());

    assert_eq!(config.connections.len(), 2);
    let primary = &config.connections[0];
    assert_eq!(primary.port, 10002);
    let osi = primary.osi.as_ref().unwrap();
    assert_eq!(osi.remote_ap_title.as_deref(), Some("1.1.1.999"));
    assert_eq!(osi.local_psel.as_bytes(), &[0, 0, 0, 2]);
    // non-bool tls falls back to plain TCP
    assert!(!config.connections[1].tls);

    assert_eq!(config.backup_timeout, Duration::from_millis(1500));
    assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    assert!(!config.failback);
    assert_eq!(config.polling_interval, Duration::from_millis(1000));

    assert_eq!(config.datasets.len(), 2);
    let ds1 = &config.datasets["icc1:DS1"];
    assert!(ds1.dynamic);
    let ds2 = &config.datasets[&format!("{}:DS2", DEFAULT_DATASET_DOMAIN)];
    assert_eq!(ds2.domain, DEFAULT_DATASET_DOMAIN);
    assert!(!ds2.dynamic);

    assert_eq!(config.transfer_sets.len(), 1);
    let dsts = &config.transfer_sets["DSTS1"];
    assert_eq!(dsts.domain, "icc1");
    assert_eq!(dsts.dataset_domain, "icc1");
    assert_eq!(dsts.conditions, DsConditions::INTERVAL | DsConditions::CHANGE);
    assert_eq!(dsts.buffer_time, 1);
    assert_eq!(dsts.integrity_check, 30);
    assert!(dsts.all_changes_reported);

    let params = dsts.params(DataSetHandle {
        domain: "icc1".into(),
        name: "DS1".into(),
    });
    assert!(params.enabled);
    assert!(params.rbe);
}

#[test]
fn test_wrong_type_rejects_document() {
    let mut config = ClientConfig::new();
    config.import_protocol_config(PROTOCOL_STACK).unwrap();

    let bad = r#"{"protocol_stack": {"transport_layer": {"connections": [], "backupTimeout": "5000"}}}"#;
    assert!(config.import_protocol_config(bad).is_err());
    assert!(!config.protocol_complete());
    // previous content untouched
    assert_eq!(config.connections.len(), 2);

    assert!(config.import_protocol_config("{ not json").is_err());
    assert!(config
        .import_protocol_config(r#"{"protocol_stack": {"application_layer": {}}}"#)
        .is_err());
}

#[test]
fn test_invalid_osi_aborts_import() {
    let doc = r#"{"protocol_stack": {"transport_layer": {"connections": [
        {"ip_addr": "127.0.0.1", "port": 102, "osi": {"local_tsel": "1 2 3 4 5"}}
    ]}}}"#;
    let mut config = ClientConfig::new();
    let err = config.import_protocol_config(doc).unwrap_err();
    assert!(matches!(err, Tase2Error::OsiError(_)));
    assert!(config.connections.is_empty());
}

#[test]
fn test_exchange_import_and_indices() {
    let mut config = ClientConfig::new();
    config.import_exchange_config(EXCHANGED_DATA).unwrap();
    assert!(config.exchange_complete());
    assert_eq!(config.exchange.len(), 5);

    for def in config.exchange.iter() {
        assert!(Arc::ptr_eq(config.definition_by_ref(&def.reference).unwrap(), def));
        assert!(Arc::ptr_eq(config.definition_by_label(&def.label).unwrap(), def));
    }
    assert!(config.definition_by_label("BAD1").is_none());
    assert!(config.definition_by_label("BAD2").is_none());
    assert!(config.definition_by_label("OTHER").is_none());
}

#[test]
fn test_polled_set_excludes_datasets_and_controls() {
    let mut config = ClientConfig::new();
    config.import_protocol_config(PROTOCOL_STACK).unwrap();
    config.import_exchange_config(EXCHANGED_DATA).unwrap();

    let polled: Vec<_> = config.polled_points().map(|d| d.reference.as_str()).collect();
    assert_eq!(polled, vec!["icc1:datapointDiscrete"]);
    assert!(!config.is_polled("icc1:datapointReal"));
    assert!(!config.is_polled("icc1:command1"));
}

#[test]
fn test_polled_set_independent_of_import_order() {
    let mut exchange_first = ClientConfig::new();
    exchange_first.import_exchange_config(EXCHANGED_DATA).unwrap();
    exchange_first.import_protocol_config(PROTOCOL_STACK).unwrap();

    let mut protocol_first = ClientConfig::new();
    protocol_first.import_protocol_config(PROTOCOL_STACK).unwrap();
    protocol_first.import_exchange_config(EXCHANGED_DATA).unwrap();

    let a: Vec<_> = exchange_first.polled_points().map(|d| d.reference.clone()).collect();
    let b: Vec<_> = protocol_first.polled_points().map(|d| d.reference.clone()).collect();
    assert_eq!(a, b);
}

#[test]
fn test_negative_polling_interval_disables_polling() {
    let doc = r#"{"protocol_stack": {
        "transport_layer": {"connections": [{"ip_addr": "::1", "port": 102}]},
        "application_layer": {"polling_interval": -5}
    }}"#;
    let mut config = ClientConfig::new();
    config.import_protocol_config(doc).unwrap();
    assert_eq!(config.polling_interval, Duration::ZERO);
    assert_eq!(config.connections[0].address, "::1");
}

#[test]
fn test_tls_import() {
    let doc = r#"{"tls_conf": {
        "private_key": "iccp_client.key",
        "own_cert": "iccp_client.cer",
        "ca_certs": [{"cert_file": "iccp_ca.cer"}],
        "remote_certs": [{"cert_file": "iccp_server.pem"}]
    }}"#;
    let mut config = ClientConfig::new().with_data_dir("/var/lib/tase2");
    config.import_tls_config(doc).unwrap();
    assert_eq!(config.tls.own_cert, "iccp_client.cer");
    assert_eq!(
        config.cert_store().cert_path("iccp_server.pem"),
        PathBuf::from("/var/lib/tase2/etc/certs/pem/iccp_server.pem")
    );
}

#[test]
fn test_transfer_sets_bind_dataset_by_domain() {
    let doc = r#"{"protocol_stack": {
        "transport_layer": {"connections": [{"ip_addr": "127.0.0.1", "port": 102}]},
        "application_layer": {
            "datasets": [
                {"dataset_ref": "DS1", "domain": "icc1", "entries": ["a"], "dynamic": true},
                {"dataset_ref": "DS1", "domain": "icc2", "entries": ["b"], "dynamic": true},
                {"dataset_ref": "DS3", "domain": "vcc", "entries": ["c"], "dynamic": false}
            ],
            "dataset_transfer_sets": [
                {"name": "TS_ICC2", "domain": "icc2", "dataset_ref": "DS1"},
                {"name": "TS_AMBIGUOUS", "dataset_ref": "DS1"},
                {"name": "TS_OTHER_DOMAIN", "domain": "icc1", "dataset_ref": "DS3"},
                {"name": "TS_STATIC", "domain": "icc1", "dataset_ref": "PREDEFINED"},
                {"name": "TS_UNBOUND", "dataset_ref": "MISSING"},
                {"name": "TS_NO_REF", "domain": "icc1"}
            ]
        }
    }}"#;
    let mut config = ClientConfig::new();
    config.import_protocol_config(doc).unwrap();

    assert_eq!(config.datasets.len(), 3);
    assert_eq!(config.datasets["icc1:DS1"].entries, vec!["a".to_string()]);
    assert_eq!(config.datasets["icc2:DS1"].entries, vec!["b".to_string()]);

    let names: Vec<&str> = config.transfer_sets.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["TS_ICC2", "TS_OTHER_DOMAIN", "TS_STATIC"]);

    let icc2 = &config.transfer_sets["TS_ICC2"];
    assert_eq!(icc2.dataset_domain, "icc2");

    let other = &config.transfer_sets["TS_OTHER_DOMAIN"];
    assert_eq!(other.domain, "icc1");
    assert_eq!(other.dataset_domain, "vcc");

    let predefined = &config.transfer_sets["TS_STATIC"];
    assert_eq!(predefined.dataset_domain, "icc1");
}

#[test]
fn test_duplicate_dataset_keeps_last_definition() {
    let doc = r#"{"protocol_stack": {
        "transport_layer": {"connections": [{"ip_addr": "127.0.0.1", "port": 102}]},
        "application_layer": {
            "datasets": [
                {"dataset_ref": "DS1", "domain": "icc1", "entries": ["a"], "dynamic": true},
                {"dataset_ref": "DS1", "domain": "icc1", "entries": ["b"], "dynamic": true}
            ]
        }
    }}"#;
    let mut config = ClientConfig::new();
    config.import_protocol_config(doc).unwrap();
    assert_eq!(config.datasets.len(), 1);
    assert_eq!(config.datasets["icc1:DS1"].entries, vec!["b".to_string()]);
}
