//! Task store schema, created on first connect.

pub(crate) const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS patient (
        patient_id TEXT PRIMARY KEY,
        patient_name TEXT
    )",
    "CREATE TABLE IF NOT EXISTS study (
        study_uid TEXT PRIMARY KEY,
        study_date TEXT,
        study_description TEXT,
        patient_id TEXT REFERENCES patient(patient_id),
        patient_weight REAL,
        patient_size REAL,
        patient_age TEXT,
        stored_in TEXT
    )",
    "CREATE TABLE IF NOT EXISTS series (
        series_uid TEXT PRIMARY KEY,
        series_date TEXT,
        series_description TEXT,
        modality TEXT,
        series_number INTEGER,
        patient_id TEXT REFERENCES patient(patient_id),
        study_uid TEXT REFERENCES study(study_uid),
        originating_task TEXT,
        stored_in TEXT
    )",
    "CREATE TABLE IF NOT EXISTS instance (
        sop_uid TEXT PRIMARY KEY,
        sop_class_uid TEXT,
        filename TEXT NOT NULL,
        patient_id TEXT REFERENCES patient(patient_id),
        study_uid TEXT REFERENCES study(study_uid),
        series_uid TEXT REFERENCES series(series_uid)
    )",
    "CREATE TABLE IF NOT EXISTS device (
        name TEXT PRIMARY KEY,
        ae_title TEXT NOT NULL,
        address TEXT NOT NULL,
        port INTEGER NOT NULL,
        is_destination INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS source (
        identifier TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS radiopharmaceutical (
        name TEXT PRIMARY KEY,
        synonyms TEXT NOT NULL DEFAULT '',
        half_life REAL
    )",
    "CREATE TABLE IF NOT EXISTS pet_model (
        name TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS task (
        id TEXT PRIMARY KEY,
        started TEXT NOT NULL,
        updated TEXT NOT NULL,
        current_step TEXT NOT NULL,
        recon_settings TEXT,
        step_state INTEGER NOT NULL,
        status_msg TEXT,
        full_status_msg TEXT,
        expected_imgs INTEGER,
        visible INTEGER NOT NULL DEFAULT 1,
        series TEXT REFERENCES series(series_uid),
        source TEXT REFERENCES source(identifier),
        radiopharmaceutical TEXT REFERENCES radiopharmaceutical(name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_step ON task(current_step, step_state)",
    "CREATE TABLE IF NOT EXISTS task_destination (
        task_id TEXT NOT NULL REFERENCES task(id),
        device_name TEXT NOT NULL REFERENCES device(name),
        PRIMARY KEY (task_id, device_name)
    )",
    "CREATE TABLE IF NOT EXISTS task_instance (
        task_id TEXT NOT NULL REFERENCES task(id),
        sop_uid TEXT NOT NULL REFERENCES instance(sop_uid),
        PRIMARY KEY (task_id, sop_uid)
    )",
    "CREATE TABLE IF NOT EXISTS filter_settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fwhm REAL NOT NULL DEFAULT 0,
        description TEXT NOT NULL DEFAULT '',
        mode TEXT NOT NULL DEFAULT 'append',
        series_number INTEGER NOT NULL DEFAULT 1001,
        noise REAL NOT NULL DEFAULT 0,
        model TEXT NOT NULL DEFAULT 'all',
        radiopharmaceutical TEXT NOT NULL DEFAULT 'all',
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS app_config (
        client_id TEXT PRIMARY KEY,
        min_instances_in_series INTEGER NOT NULL DEFAULT 47,
        slice_gap_tolerance REAL NOT NULL DEFAULT 0.025,
        series_timeout INTEGER NOT NULL DEFAULT 30,
        store_scp_port INTEGER NOT NULL,
        store_scp_aet TEXT NOT NULL,
        ip_address TEXT NOT NULL DEFAULT '',
        mirror_mode INTEGER NOT NULL DEFAULT 0,
        server_url TEXT NOT NULL,
        shared_mount_point TEXT NOT NULL,
        zip_dir TEXT NOT NULL,
        unzip_dir TEXT NOT NULL,
        download_path TEXT NOT NULL
    )",
];
