pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY,
        user_id INTEGER,
        name TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0
    );

    -- Names are unique within their visibility scope.
    CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_global_name
        ON categories(name) WHERE user_id IS NULL;
    CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_account_name
        ON categories(user_id, name) WHERE user_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS images (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        category_id INTEGER,
        filename TEXT NOT NULL,
        filepath TEXT NOT NULL,
        thumbnail_path TEXT,
        file_size INTEGER NOT NULL,
        mime_type TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        ai_description TEXT,
        ai_metadata TEXT,
        upload_time TEXT NOT NULL,
        FOREIGN KEY(category_id) REFERENCES categories(id) ON DELETE SET NULL
    );

    CREATE INDEX IF NOT EXISTS idx_images_user ON images(user_id);

    CREATE TABLE IF NOT EXISTS exif_data (
        image_id INTEGER PRIMARY KEY,
        camera_make TEXT,
        camera_model TEXT,
        datetime_original TEXT,
        exposure_time TEXT,
        f_number REAL,
        iso INTEGER,
        focal_length REAL,
        gps_latitude REAL,
        gps_longitude REAL,
        orientation INTEGER,
        FOREIGN KEY(image_id) REFERENCES images(id) ON DELETE CASCADE
    );
";
