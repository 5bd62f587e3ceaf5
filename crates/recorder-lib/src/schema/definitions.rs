//! Built-in table definitions for every table the recorder writes

use super::{MetricFamily, SchemaEntry, TableKind};

fn entry(kind: TableKind, name: &str, columns: &[&str]) -> SchemaEntry {
    SchemaEntry {
        kind,
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
    }
}

fn reference(name: &str, columns: &[&str]) -> SchemaEntry {
    entry(TableKind::Reference, name, columns)
}

const CPU_MEMORY: &[&str] = &[
    "_cpuusage REAL NOT NULL DEFAULT 0",
    "_memoryused REAL NOT NULL DEFAULT 0",
    "_swapused REAL NOT NULL DEFAULT 0",
    "_memorysize INTEGER NOT NULL DEFAULT 0",
    "_memoryrss INTEGER NOT NULL DEFAULT 0",
];

const NETWORK: &[&str] = &[
    "_netiorate INTEGER NOT NULL DEFAULT 0",
    "_netirate INTEGER NOT NULL DEFAULT 0",
    "_netorate INTEGER NOT NULL DEFAULT 0",
    "_netierror INTEGER NOT NULL DEFAULT 0",
    "_netoerror INTEGER NOT NULL DEFAULT 0",
];

fn metric(family: MetricFamily, groups: &[&[&str]]) -> [SchemaEntry; 2] {
    let mut columns: Vec<String> = family
        .key_columns()
        .iter()
        .map(|key| format!("{} INTEGER NOT NULL", key))
        .collect();
    columns.push("_ontunetime INTEGER NOT NULL".to_string());
    columns.push("_agenttime INTEGER NOT NULL".to_string());
    for group in groups {
        columns.extend(group.iter().map(|c| c.to_string()));
    }

    let mut index = vec!["_ontunetime".to_string()];
    index.extend(family.key_columns().iter().map(|k| k.to_string()));

    [
        SchemaEntry {
            kind: TableKind::Metric,
            name: family.base_name().to_string(),
            columns,
        },
        SchemaEntry {
            kind: TableKind::Index,
            name: family.base_name().to_string(),
            columns: index,
        },
    ]
}

/// Reference, metric and index entries in creation order
pub fn default_entries() -> Vec<SchemaEntry> {
    let mut entries = vec![
        reference(
            "kubemanagerinfo",
            &[
                "_managerid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_managername TEXT NOT NULL",
                "_description TEXT",
                "_ip TEXT NOT NULL",
            ],
        ),
        reference(
            "kubeclusterinfo",
            &[
                "_clusterid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_managerid INTEGER NOT NULL",
                "_clustername TEXT NOT NULL",
                "_description TEXT",
                "_ip TEXT NOT NULL",
            ],
        ),
        reference(
            "kubensinfo",
            &[
                "_nsid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsname TEXT NOT NULL",
                "_status TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubenodeinfo",
            &[
                "_nodeid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_managerid INTEGER NOT NULL",
                "_clusterid INTEGER NOT NULL",
                "_nodeuid TEXT NOT NULL",
                "_nodename TEXT NOT NULL",
                "_nodenameext TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
                "_state INTEGER NOT NULL DEFAULT 1",
                "_connected INTEGER NOT NULL DEFAULT 1",
                "_starttime INTEGER",
                "_kernelversion TEXT",
                "_osimage TEXT",
                "_osname TEXT",
                "_containerruntimever TEXT",
                "_kubeletver TEXT",
                "_kubeproxyver TEXT",
                "_cpuarch TEXT",
                "_cpucount INTEGER",
                "_ephemeralstorage INTEGER",
                "_memorysize INTEGER",
                "_pods INTEGER",
                "_ip TEXT",
            ],
        ),
        reference(
            "kubenodesyscoinfo",
            &[
                "_syscontainerid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_nodeid INTEGER NOT NULL",
                "_containername TEXT NOT NULL",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubesvcinfo",
            &[
                "_svcid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_svcname TEXT NOT NULL",
                "_uid TEXT NOT NULL",
                "_starttime INTEGER",
                "_servicetype TEXT",
                "_clusterip TEXT",
                "_ports TEXT",
                "_selector TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubedeployinfo",
            &[
                "_deployid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_deployname TEXT NOT NULL",
                "_uid TEXT NOT NULL",
                "_starttime INTEGER",
                "_serviceaccount TEXT",
                "_replicas INTEGER",
                "_updatedrs INTEGER",
                "_readyrs INTEGER",
                "_availablers INTEGER",
                "_observedgen INTEGER",
                "_selector TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubestsinfo",
            &[
                "_stsid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_stsname TEXT NOT NULL",
                "_uid TEXT NOT NULL",
                "_starttime INTEGER",
                "_serviceaccount TEXT",
                "_replicas INTEGER",
                "_readyrs INTEGER",
                "_availablers INTEGER",
                "_selector TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubedsinfo",
            &[
                "_dsid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_dsname TEXT NOT NULL",
                "_uid TEXT NOT NULL",
                "_starttime INTEGER",
                "_serviceaccount TEXT",
                "_current INTEGER",
                "_desired INTEGER",
                "_ready INTEGER",
                "_updated INTEGER",
                "_available INTEGER",
                "_selector TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubersinfo",
            &[
                "_rsid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_rsname TEXT NOT NULL",
                "_uid TEXT NOT NULL",
                "_starttime INTEGER",
                "_replicas INTEGER",
                "_fullylabeledrs INTEGER",
                "_readyrs INTEGER",
                "_availablers INTEGER",
                "_observedgen INTEGER",
                "_selector TEXT",
                "_refkind TEXT",
                "_refid INTEGER",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubepodinfo",
            &[
                "_podid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_nodeid INTEGER NOT NULL",
                "_nsid INTEGER NOT NULL",
                "_uid TEXT NOT NULL",
                "_annotationuid TEXT",
                "_podname TEXT NOT NULL",
                "_starttime INTEGER",
                "_restartpolicy TEXT",
                "_serviceaccount TEXT",
                "_status TEXT",
                "_hostip TEXT",
                "_podip TEXT",
                "_restartcount INTEGER",
                "_restarttime INTEGER",
                "_condition TEXT",
                "_refkind TEXT",
                "_refid INTEGER",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kuberefcontainerinfo",
            &[
                "_refcontainerid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_clusterid INTEGER NOT NULL",
                "_refobjkind TEXT NOT NULL",
                "_objid INTEGER NOT NULL",
                "_refcontainername TEXT NOT NULL",
                "_image TEXT NOT NULL",
                "_ports TEXT",
                "_env TEXT",
                "_resources TEXT",
                "_volumemounts TEXT",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubecontainerinfo",
            &[
                "_containerid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_podid INTEGER NOT NULL",
                "_containername TEXT NOT NULL",
                "_starttime INTEGER",
                "_enabled INTEGER NOT NULL DEFAULT 1",
            ],
        ),
        reference(
            "kubepoddeviceinfo",
            &[
                "_deviceid INTEGER PRIMARY KEY AUTOINCREMENT",
                "_devicename TEXT NOT NULL",
                "_devicetype TEXT NOT NULL",
            ],
        ),
        reference(
            "kubelastrealtimeperf",
            &[
                "_nodeid INTEGER NOT NULL",
                "_ontunetime INTEGER NOT NULL",
                "_cpuusage REAL NOT NULL DEFAULT 0",
                "_memoryused REAL NOT NULL DEFAULT 0",
                "_swapused REAL NOT NULL DEFAULT 0",
                "_memorysize INTEGER NOT NULL DEFAULT 0",
                "_memoryrss INTEGER NOT NULL DEFAULT 0",
                "_netusage INTEGER NOT NULL DEFAULT 0",
                "_fsusage REAL NOT NULL DEFAULT 0",
                "_fssize INTEGER NOT NULL DEFAULT 0",
                "_fsiusage REAL NOT NULL DEFAULT 0",
                "_imgfsusage REAL NOT NULL DEFAULT 0",
                "_proccount INTEGER NOT NULL DEFAULT 0",
            ],
        ),
    ];

    entries.extend(metric(
        MetricFamily::NodePerf,
        &[
            CPU_MEMORY,
            NETWORK,
            &[
                "_fsusage REAL NOT NULL DEFAULT 0",
                "_fssize INTEGER NOT NULL DEFAULT 0",
                "_fsfree INTEGER NOT NULL DEFAULT 0",
                "_fsiusage REAL NOT NULL DEFAULT 0",
                "_fsisize INTEGER NOT NULL DEFAULT 0",
                "_fsifree INTEGER NOT NULL DEFAULT 0",
                "_imgfsusage REAL NOT NULL DEFAULT 0",
                "_maxpid INTEGER NOT NULL DEFAULT 0",
                "_proccount INTEGER NOT NULL DEFAULT 0",
            ],
        ],
    ));
    entries.extend(metric(MetricFamily::NodeSysco, &[CPU_MEMORY]));
    entries.extend(metric(
        MetricFamily::PodPerf,
        &[
            CPU_MEMORY,
            NETWORK,
            &[
                "_volused INTEGER NOT NULL DEFAULT 0",
                "_voliused INTEGER NOT NULL DEFAULT 0",
                "_epstused INTEGER NOT NULL DEFAULT 0",
                "_epstiused INTEGER NOT NULL DEFAULT 0",
                "_proccount INTEGER NOT NULL DEFAULT 0",
            ],
        ],
    ));
    entries.extend(metric(
        MetricFamily::ContainerPerf,
        &[
            CPU_MEMORY,
            &[
                "_rootfsused INTEGER NOT NULL DEFAULT 0",
                "_rootfsiused INTEGER NOT NULL DEFAULT 0",
                "_logfsused INTEGER NOT NULL DEFAULT 0",
                "_logfsiused INTEGER NOT NULL DEFAULT 0",
            ],
        ],
    ));
    entries.extend(metric(MetricFamily::PodNet, &[NETWORK]));
    entries.extend(metric(
        MetricFamily::PodVol,
        &[&[
            "_used INTEGER NOT NULL DEFAULT 0",
            "_iused INTEGER NOT NULL DEFAULT 0",
        ]],
    ));

    entries
}
