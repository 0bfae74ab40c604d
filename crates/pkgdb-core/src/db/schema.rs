//! Table and view definitions

/// Bumped when tables change; databases live under `v<N>/` of the cache
pub const TABLES_VERSION: u32 = 1;

/// Bumped when views change; views are recreated in place
pub const VIEWS_VERSION: u32 = 1;

/// Roots of the attribute set tree use this parent id
pub const ROOT_PARENT: i64 = 0;

pub const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS DbVersions (
  name     TEXT NOT NULL PRIMARY KEY
, version  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS LockedInput (
  fingerprint  TEXT NOT NULL PRIMARY KEY
, url          TEXT NOT NULL
, attrs        JSON NOT NULL
);

CREATE TRIGGER IF NOT EXISTS IT_LockedInput AFTER INSERT ON LockedInput
  WHEN ( 1 < ( SELECT COUNT( fingerprint ) FROM LockedInput ) )
  BEGIN
    SELECT RAISE( ABORT, 'a database describes exactly one locked input' );
  END;

CREATE TABLE IF NOT EXISTS AttrSets (
  id        INTEGER PRIMARY KEY
, parent    INTEGER NOT NULL DEFAULT 0
, attrName  VARCHAR( 255 ) NOT NULL
, done      BOOL NOT NULL DEFAULT FALSE
, CONSTRAINT UC_AttrSets UNIQUE ( parent, attrName )
);

CREATE TABLE IF NOT EXISTS Descriptions (
  id           INTEGER PRIMARY KEY
, description  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS Packages (
  id                INTEGER PRIMARY KEY
, parentId          INTEGER NOT NULL
, attrName          VARCHAR( 255 ) NOT NULL
, name              VARCHAR( 255 ) NOT NULL
, pname             VARCHAR( 255 )
, version           VARCHAR( 127 )
, semver            VARCHAR( 127 )
, license           VARCHAR( 255 )
, outputs           JSON NOT NULL
, outputsToInstall  JSON
, broken            BOOL
, unfree            BOOL
, descriptionId     INTEGER
, FOREIGN KEY ( parentId ) REFERENCES AttrSets ( id )
, FOREIGN KEY ( descriptionId ) REFERENCES Descriptions ( id )
, CONSTRAINT UC_Packages UNIQUE ( parentId, attrName )
);

CREATE INDEX IF NOT EXISTS IDX_Packages_pname ON Packages ( pname );
"#;

pub const DROP_VIEWS: &str = r#"
DROP VIEW IF EXISTS v_PackagesSearch;
DROP VIEW IF EXISTS v_PackagesVersions;
DROP VIEW IF EXISTS v_Semvers;
DROP VIEW IF EXISTS v_AttrPaths;
"#;

pub const VIEWS: &str = r#"
CREATE VIEW IF NOT EXISTS v_AttrPaths AS
  WITH RECURSIVE Tree ( id, parent, attrName, subtree, system, path ) AS (
    SELECT id, parent, attrName
         , attrName AS subtree
         , NULL AS system
         , json_array( attrName ) AS path
    FROM AttrSets WHERE ( parent = 0 )
    UNION ALL SELECT O.id, O.parent, O.attrName
                   , Parent.subtree
                   , CASE WHEN ( Parent.system IS NULL ) THEN O.attrName
                          ELSE Parent.system END AS system
                   , json_insert( Parent.path, '$[#]', O.attrName ) AS path
    FROM AttrSets O INNER JOIN Tree AS Parent ON ( Parent.id = O.parent )
  ) SELECT * FROM Tree;

CREATE VIEW IF NOT EXISTS v_Semvers AS SELECT
  semver
, CAST( major AS INTEGER ) AS major
, CAST( minor AS INTEGER ) AS minor
, CAST( CASE WHEN ( instr( rest, '-' ) <= 0 ) THEN rest
             ELSE substr( rest, 1, instr( rest, '-' ) - 1 ) END AS INTEGER ) AS patch
, CASE WHEN ( instr( rest, '-' ) <= 0 ) THEN NULL
       ELSE substr( rest, instr( rest, '-' ) + 1 ) END AS preTag
FROM (
  SELECT semver, major
       , substr( rest, 1, instr( rest, '.' ) - 1 ) AS minor
       , substr( rest, instr( rest, '.' ) + 1 ) AS rest
  FROM (
    SELECT semver
         , substr( semver, 1, instr( semver, '.' ) - 1 ) AS major
         , substr( semver, instr( semver, '.' ) + 1 ) AS rest
    FROM ( SELECT DISTINCT semver FROM Packages WHERE ( semver IS NOT NULL ) )
  )
);

CREATE VIEW IF NOT EXISTS v_PackagesVersions AS SELECT
  id
, versionDate
, CASE WHEN ( version IS NULL ) THEN 3
       WHEN ( semver IS NOT NULL ) THEN 0
       WHEN ( versionDate IS NOT NULL ) THEN 1
       ELSE 2 END AS versionType
FROM (
  SELECT id, version, semver
       , CASE WHEN ( semver IS NOT NULL ) THEN NULL
              WHEN ( version GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*' )
                THEN substr( version, 1, 10 )
              WHEN ( version GLOB '[0-9][0-9]-[0-9][0-9]-[0-9][0-9][0-9][0-9]*' )
                THEN substr( version, 7, 4 ) || '-' || substr( version, 1, 2 )
                     || '-' || substr( version, 4, 2 )
              ELSE NULL END AS versionDate
  FROM Packages
);

CREATE VIEW IF NOT EXISTS v_PackagesSearch AS SELECT
  Packages.id
, v_AttrPaths.subtree
, v_AttrPaths.system
, json_insert( v_AttrPaths.path, '$[#]', Packages.attrName ) AS path
, json_remove( json_insert( v_AttrPaths.path, '$[#]', Packages.attrName )
             , '$[0]', '$[0]' ) AS relPath
, ( json_array_length( v_AttrPaths.path ) + 1 ) AS depth
, Packages.name
, Packages.attrName
, Packages.pname
, Packages.version
, v_PackagesVersions.versionDate
, Packages.semver
, v_Semvers.major
, v_Semvers.minor
, v_Semvers.patch
, v_Semvers.preTag
, v_PackagesVersions.versionType
, Packages.license
, Packages.broken
, CASE WHEN ( Packages.broken IS NULL ) THEN 1
       WHEN Packages.broken THEN 2 ELSE 0 END AS brokenRank
, Packages.unfree
, CASE WHEN ( Packages.unfree IS NULL ) THEN 1
       WHEN Packages.unfree THEN 2 ELSE 0 END AS unfreeRank
, Descriptions.description
FROM Packages
LEFT OUTER JOIN Descriptions ON ( Packages.descriptionId = Descriptions.id )
LEFT OUTER JOIN v_Semvers    ON ( Packages.semver = v_Semvers.semver )
INNER JOIN v_AttrPaths        ON ( Packages.parentId = v_AttrPaths.id )
INNER JOIN v_PackagesVersions ON ( Packages.id = v_PackagesVersions.id );
"#;
